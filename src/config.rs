use std::path::PathBuf;
use std::sync::Arc;

use crate::codec::DeleteCodec;
use crate::error::{Error, Result};
use crate::merge::MergePolicy;
use crate::order::{LexOrder, RowOrder};

/// Configuration for a table store.
///
/// Row width and row order are part of the data format: they must not
/// change for the lifetime of a store's files.
#[derive(Clone)]
pub struct StoreConfig {
    /// Root directory for all store files; created if absent.
    pub root_dir: PathBuf,

    /// Fixed row width in bytes. Must be at least the order's key width.
    pub row_width: usize,

    /// Total order over rows' key regions.
    pub row_order: Arc<dyn RowOrder>,

    /// Tombstone codec. Without one, deletes are not supported.
    pub delete_codec: Option<Arc<dyn DeleteCodec>>,

    /// Flush and compaction thresholds.
    pub merge_policy: MergePolicy,
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("root_dir", &self.root_dir)
            .field("row_width", &self.row_width)
            .field("key_width", &self.row_order.key_width())
            .field("delete_codec", &self.delete_codec.is_some())
            .field("merge_policy", &self.merge_policy)
            .finish()
    }
}

impl StoreConfig {
    /// Config with a lexicographic order over the leading `key_width`
    /// bytes and no delete codec.
    pub fn new(root_dir: impl Into<PathBuf>, row_width: usize, key_width: usize) -> Self {
        Self::with_order(root_dir, row_width, Arc::new(LexOrder::new(key_width)))
    }

    /// Config with a caller-supplied row order.
    pub fn with_order(
        root_dir: impl Into<PathBuf>,
        row_width: usize,
        row_order: Arc<dyn RowOrder>,
    ) -> Self {
        Self {
            root_dir: root_dir.into(),
            row_width,
            row_order,
            delete_codec: None,
            merge_policy: MergePolicy::default(),
        }
    }

    /// Set the delete codec.
    pub fn delete_codec(mut self, codec: Arc<dyn DeleteCodec>) -> Self {
        self.delete_codec = Some(codec);
        self
    }

    /// Set the merge policy.
    pub fn merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn key_width(&self) -> usize {
        self.row_order.key_width()
    }

    /// Checks the configuration at open time.
    pub fn validate(&self) -> Result<()> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(Error::Config("empty root directory".to_string()));
        }
        let key_width = self.row_order.key_width();
        if key_width == 0 {
            return Err(Error::Config("zero key width".to_string()));
        }
        if self.row_width < key_width {
            return Err(Error::Config(format!(
                "row width {} is smaller than key width {}",
                self.row_width, key_width
            )));
        }
        if self.merge_policy.write_ahead_flush_trigger == 0 {
            return Err(Error::Config("zero write-ahead flush trigger".to_string()));
        }
        if self.merge_policy.generation_factor < 2 {
            return Err(Error::Config(format!(
                "generation factor {} must be at least 2",
                self.merge_policy.generation_factor
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_widths() {
        assert!(StoreConfig::new("/tmp/k", 8, 4).validate().is_ok());
        assert!(StoreConfig::new("/tmp/k", 8, 8).validate().is_ok());
        assert!(StoreConfig::new("/tmp/k", 4, 8).validate().is_err());
        assert!(StoreConfig::new("/tmp/k", 8, 0).validate().is_err());
        assert!(StoreConfig::new("", 8, 4).validate().is_err());
    }

    #[test]
    fn chained_setters() {
        let config = StoreConfig::new("/tmp/k", 8, 4)
            .delete_codec(Arc::new(crate::codec::MagicDeleteCodec::u32(4, 0)))
            .merge_policy(MergePolicy::default().write_ahead_flush_trigger(64));
        assert!(config.delete_codec.is_some());
        assert_eq!(config.merge_policy.write_ahead_flush_trigger, 64);
        assert!(config.validate().is_ok());
    }
}
