//! Table sets: an immutable, ordered stack of sorted tables presenting
//! one merged key space.
//!
//! Tables are kept oldest first; lookups scan newest first so the last
//! writer wins. A set never mutates: appending or splicing produces a new
//! instance sharing the unchanged tables. The optional delete codec turns
//! the set tombstone-aware (lookups report tombstoned keys as absent and
//! iteration skips them) without a separate type.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::codec::DeleteCodec;
use crate::error::{Error, Result};
use crate::order::RowOrder;
use crate::table::sorted::{SortedTable, SortedTableIter};

pub struct TableSet {
    tables: Vec<Arc<SortedTable>>,
    order: Arc<dyn RowOrder>,
    row_width: usize,
    delete_codec: Option<Arc<dyn DeleteCodec>>,
    commit_id: u64,
}

impl TableSet {
    /// Builds a set over `tables` (oldest first). Every table must share
    /// `row_width` and the same order instance; a mismatch is a
    /// configuration error.
    pub fn new(
        order: Arc<dyn RowOrder>,
        row_width: usize,
        tables: Vec<Arc<SortedTable>>,
        delete_codec: Option<Arc<dyn DeleteCodec>>,
        commit_id: u64,
    ) -> Result<Self> {
        for table in &tables {
            if table.row_width() != row_width {
                return Err(Error::Config(format!(
                    "table {} has row width {}, set expects {}",
                    table.id(),
                    table.row_width(),
                    row_width
                )));
            }
            if !Arc::ptr_eq(table.order(), &order) {
                return Err(Error::Config(format!(
                    "table {} was opened under a different row order",
                    table.id()
                )));
            }
        }
        Ok(Self {
            tables,
            order,
            row_width,
            delete_codec,
            commit_id,
        })
    }

    /// The empty set for a given commit id.
    pub fn empty(
        order: Arc<dyn RowOrder>,
        row_width: usize,
        delete_codec: Option<Arc<dyn DeleteCodec>>,
        commit_id: u64,
    ) -> Self {
        Self {
            tables: Vec::new(),
            order,
            row_width,
            delete_codec,
            commit_id,
        }
    }

    /// New set with `table` logically on top (newest). The receiver is
    /// unchanged.
    pub fn append(&self, table: Arc<SortedTable>, commit_id: u64) -> Result<Self> {
        self.append_all(std::slice::from_ref(&table), commit_id)
    }

    /// New set with several tables stacked on top, oldest of them first.
    pub fn append_all(&self, new_tables: &[Arc<SortedTable>], commit_id: u64) -> Result<Self> {
        let mut tables = self.tables.clone();
        tables.extend(new_tables.iter().cloned());
        Self::new(
            Arc::clone(&self.order),
            self.row_width,
            tables,
            self.delete_codec.clone(),
            commit_id,
        )
    }

    /// Physical lookup: newest-first scan, returning the first row whose
    /// key matches, tombstone or not.
    pub fn raw_row(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        for table in self.tables.iter().rev() {
            if let Some(row) = table.get(key)? {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    /// Logical lookup: like `raw_row`, but a tombstone hit reads as
    /// absent when a delete codec is configured.
    pub fn get_row(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match (self.raw_row(key)?, &self.delete_codec) {
            (Some(row), Some(codec)) if codec.is_deleted(&row) => Ok(None),
            (row, _) => Ok(row),
        }
    }

    /// Ascending merged iteration over the whole set: shadowed keys are
    /// deduplicated (newest table wins) and, with a codec, tombstones are
    /// skipped.
    pub fn iter(&self) -> MergedRows {
        MergedRows::new(
            self.tables
                .iter()
                .map(|t| SortedTableIter::new(Arc::clone(t)))
                .collect(),
            Arc::clone(&self.order),
            self.delete_codec.clone(),
        )
    }

    /// Tables oldest first.
    pub fn tables(&self) -> &[Arc<SortedTable>] {
        &self.tables
    }

    /// Table ids oldest first; always identical to the id list of the
    /// commit record this set was built from.
    pub fn table_ids(&self) -> Vec<u64> {
        self.tables.iter().map(|t| t.id()).collect()
    }

    pub fn commit_id(&self) -> u64 {
        self.commit_id
    }

    pub fn row_width(&self) -> usize {
        self.row_width
    }

    pub fn order(&self) -> &Arc<dyn RowOrder> {
        &self.order
    }

    pub fn delete_codec(&self) -> Option<&Arc<dyn DeleteCodec>> {
        self.delete_codec.as_ref()
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Closes every contained table.
    pub fn close(&self) {
        for table in &self.tables {
            table.close();
        }
    }
}

impl std::fmt::Debug for TableSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableSet")
            .field("commit_id", &self.commit_id)
            .field("table_ids", &self.table_ids())
            .finish()
    }
}

struct HeapEntry {
    row: Vec<u8>,
    source: usize,
    iter: SortedTableIter,
    order: Arc<dyn RowOrder>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Max-heap: smallest key first; on equal keys the newest source
    // (highest index) surfaces first and wins.
    fn cmp(&self, other: &Self) -> Ordering {
        match self.order.compare(&self.row, &other.row) {
            Ordering::Equal => self.source.cmp(&other.source),
            ord => ord.reverse(),
        }
    }
}

/// K-way merged, deduplicated, ascending row stream over a table stack.
pub struct MergedRows {
    heap: BinaryHeap<HeapEntry>,
    order: Arc<dyn RowOrder>,
    delete_codec: Option<Arc<dyn DeleteCodec>>,
    last_row: Option<Vec<u8>>,
    pending_error: Option<Error>,
    failed: bool,
}

impl MergedRows {
    pub(crate) fn new(
        iters: Vec<SortedTableIter>,
        order: Arc<dyn RowOrder>,
        delete_codec: Option<Arc<dyn DeleteCodec>>,
    ) -> Self {
        let mut merged = Self {
            heap: BinaryHeap::new(),
            order,
            delete_codec,
            last_row: None,
            pending_error: None,
            failed: false,
        };
        for (source, mut iter) in iters.into_iter().enumerate() {
            match iter.next() {
                Some(Ok(row)) => merged.heap.push(HeapEntry {
                    row,
                    source,
                    iter,
                    order: Arc::clone(&merged.order),
                }),
                Some(Err(e)) => {
                    merged.pending_error = Some(e);
                }
                None => {}
            }
        }
        merged
    }

    fn push_next(&mut self, mut entry: HeapEntry) -> Result<()> {
        match entry.iter.next() {
            Some(Ok(row)) => {
                entry.row = row;
                self.heap.push(entry);
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }
}

impl Iterator for MergedRows {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(e) = self.pending_error.take() {
            self.failed = true;
            return Some(Err(e));
        }
        while let Some(entry) = self.heap.pop() {
            // Shadowed copy of a key already emitted (or skipped).
            let shadowed = self
                .last_row
                .as_ref()
                .is_some_and(|last| self.order.compare(last, &entry.row) == Ordering::Equal);
            if shadowed {
                if let Err(e) = self.push_next(entry) {
                    self.failed = true;
                    return Some(Err(e));
                }
                continue;
            }

            let row = entry.row.clone();
            self.last_row = Some(row.clone());
            if let Err(e) = self.push_next(entry) {
                self.failed = true;
                return Some(Err(e));
            }

            if let Some(codec) = &self.delete_codec {
                if codec.is_deleted(&row) {
                    continue;
                }
            }
            return Some(Ok(row));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::LexOrder;
    use crate::table::sorted::TableWriter;
    use std::path::Path;
    use tempfile::tempdir;

    fn row(key: u32, value: u32) -> Vec<u8> {
        let mut row = key.to_be_bytes().to_vec();
        row.extend_from_slice(&value.to_be_bytes());
        row
    }

    fn table(
        path: &Path,
        order: &Arc<dyn RowOrder>,
        id: u64,
        rows: &[(u32, u32)],
    ) -> Arc<SortedTable> {
        let mut writer = TableWriter::create(path, 8).unwrap();
        for (k, v) in rows {
            writer.append(&row(*k, *v)).unwrap();
        }
        writer.finish().unwrap();
        Arc::new(SortedTable::open(path, 8, Arc::clone(order), id).unwrap())
    }

    fn order() -> Arc<dyn RowOrder> {
        Arc::new(LexOrder::new(4))
    }

    #[test]
    fn newest_table_wins() -> Result<()> {
        let dir = tempdir().unwrap();
        let order = order();
        let old = table(&dir.path().join("T1.stbl"), &order, 1, &[(1, 10), (2, 20)]);
        let new = table(&dir.path().join("T2.stbl"), &order, 2, &[(2, 99), (3, 30)]);

        let set = TableSet::new(Arc::clone(&order), 8, vec![old, new], None, 1)?;

        assert_eq!(set.get_row(&1u32.to_be_bytes())?, Some(row(1, 10)));
        assert_eq!(set.get_row(&2u32.to_be_bytes())?, Some(row(2, 99)));
        assert_eq!(set.get_row(&3u32.to_be_bytes())?, Some(row(3, 30)));
        assert_eq!(set.get_row(&4u32.to_be_bytes())?, None);
        Ok(())
    }

    #[test]
    fn merged_iteration_dedups_newest_wins() -> Result<()> {
        let dir = tempdir().unwrap();
        let order = order();
        let a = table(&dir.path().join("T1.stbl"), &order, 1, &[(1, 1), (5, 1), (9, 1)]);
        let b = table(&dir.path().join("T2.stbl"), &order, 2, &[(5, 2), (7, 2)]);
        let c = table(&dir.path().join("T3.stbl"), &order, 3, &[(1, 3)]);

        let set = TableSet::new(Arc::clone(&order), 8, vec![a, b, c], None, 1)?;
        let rows: Vec<Vec<u8>> = set.iter().collect::<Result<_>>()?;

        assert_eq!(rows, vec![row(1, 3), row(5, 2), row(7, 2), row(9, 1)]);
        Ok(())
    }

    #[test]
    fn tombstones_hide_rows_when_codec_present() -> Result<()> {
        let dir = tempdir().unwrap();
        let order = order();
        let codec: Arc<dyn DeleteCodec> = Arc::new(crate::codec::MagicDeleteCodec::u32(4, 0));

        let live = table(&dir.path().join("T1.stbl"), &order, 1, &[(1, 10), (2, 20)]);
        // Value 0 is the tombstone magic.
        let dead = table(&dir.path().join("T2.stbl"), &order, 2, &[(1, 0)]);

        let set = TableSet::new(
            Arc::clone(&order),
            8,
            vec![live, dead],
            Some(codec),
            1,
        )?;

        // Physically present, logically absent.
        assert_eq!(set.raw_row(&1u32.to_be_bytes())?, Some(row(1, 0)));
        assert_eq!(set.get_row(&1u32.to_be_bytes())?, None);
        assert_eq!(set.get_row(&2u32.to_be_bytes())?, Some(row(2, 20)));

        let rows: Vec<Vec<u8>> = set.iter().collect::<Result<_>>()?;
        assert_eq!(rows, vec![row(2, 20)]);
        Ok(())
    }

    #[test]
    fn append_leaves_receiver_unchanged() -> Result<()> {
        let dir = tempdir().unwrap();
        let order = order();
        let a = table(&dir.path().join("T1.stbl"), &order, 1, &[(1, 1)]);
        let b = table(&dir.path().join("T2.stbl"), &order, 2, &[(1, 2)]);

        let base = TableSet::new(Arc::clone(&order), 8, vec![a], None, 1)?;
        let extended = base.append(b, 2)?;

        assert_eq!(base.table_ids(), vec![1]);
        assert_eq!(extended.table_ids(), vec![1, 2]);
        assert_eq!(base.get_row(&1u32.to_be_bytes())?, Some(row(1, 1)));
        assert_eq!(extended.get_row(&1u32.to_be_bytes())?, Some(row(1, 2)));
        Ok(())
    }

    #[test]
    fn rejects_mismatched_tables() {
        let dir = tempdir().unwrap();
        let order = order();
        let narrow = {
            let mut writer = TableWriter::create(&dir.path().join("T1.stbl"), 4).unwrap();
            writer.append(&1u32.to_be_bytes()).unwrap();
            writer.finish().unwrap();
            Arc::new(
                SortedTable::open(&dir.path().join("T1.stbl"), 4, Arc::clone(&order), 1).unwrap(),
            )
        };

        assert!(TableSet::new(order, 8, vec![narrow], None, 1).is_err());
    }

    #[test]
    fn close_closes_all_tables() -> Result<()> {
        let dir = tempdir().unwrap();
        let order = order();
        let a = table(&dir.path().join("T1.stbl"), &order, 1, &[(1, 1)]);
        let b = table(&dir.path().join("T2.stbl"), &order, 2, &[(2, 2)]);

        let set = TableSet::new(Arc::clone(&order), 8, vec![a.clone(), b.clone()], None, 1)?;
        set.close();
        assert!(!a.is_open());
        assert!(!b.is_open());
        Ok(())
    }
}
