//! The table store orchestrator.
//!
//! Owns the durable counters, the current commit record, the active table
//! set, and the write-ahead buffer, and runs the background merge engine.
//!
//! # Locking
//!
//! Two mutual-exclusion scopes serialize the store:
//!
//! - the **api** scope (the write-ahead mutex) covers every read-modify-
//!   write of the write-ahead buffer, so client calls see writes in call
//!   order;
//! - the **back-set** scope (the published mutex) covers only the
//!   `(table set, commit record)` pointer pair, so merge publication and
//!   flush commit swap state without stalling readers for longer than
//!   the pointer swap plus the commit-record write.
//!
//! Merges themselves run outside both locks against reference-held,
//! immutable tables.
//!
//! # Commit protocol
//!
//! Every state transition writes the new commit file first and advances
//! the commit-number counter second. A crash between the two leaves the
//! counter on the old commit, which recovery then loads; the orphaned
//! commit file for `counter + 1` is discarded at the next open.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::commit::CommitRecord;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::keystone::Keystone;
use crate::merge::{MergeContext, TableMergeEngine};
use crate::table::sorted::{SortedTable, TableWriter};
use crate::table::write_ahead::WriteAheadBuffer;
use crate::table::TableSet;

pub const COUNTERS_FILENAME: &str = "tc.counts";
pub const TRASH_DIRNAME: &str = "removed";
const LOCK_FILENAME: &str = "karoon.lock";
const TABLE_PREFIX: &str = "T";
const COMMIT_PREFIX: &str = "C";
const SORTED_TABLE_EXT: &str = "stbl";
const WRITE_AHEAD_EXT: &str = "utbl";
const COMMIT_EXT: &str = "cmmt";

fn sorted_table_path_in(root: &Path, table_id: u64) -> PathBuf {
    root.join(format!("{}{}.{}", TABLE_PREFIX, table_id, SORTED_TABLE_EXT))
}

fn write_ahead_path_in(root: &Path, table_id: u64) -> PathBuf {
    root.join(format!("{}{}.{}", TABLE_PREFIX, table_id, WRITE_AHEAD_EXT))
}

fn commit_path_in(root: &Path, commit_id: u64) -> PathBuf {
    root.join(format!("{}{}.{}", COMMIT_PREFIX, commit_id, COMMIT_EXT))
}

/// Moves `path` into the trash directory instead of deleting it, creating
/// the directory on demand. A no-op when `path` doesn't exist.
fn discard_into(trash_dir: &Path, path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(trash_dir)?;
    let name = path
        .file_name()
        .ok_or_else(|| Error::InvalidState(format!("cannot trash {}", path.display())))?;
    let dest = trash_dir.join(name);
    if dest.exists() {
        std::fs::remove_file(&dest)?;
    }
    std::fs::rename(path, &dest)?;
    tracing::debug!(file = %path.display(), "moved to trash");
    Ok(())
}

struct Published {
    table_set: Arc<TableSet>,
    commit: CommitRecord,
}

struct StoreInner {
    config: StoreConfig,
    _lock: FileLock,
    trash_dir: PathBuf,
    table_counter: Keystone,
    commit_number: Keystone,
    wal_table_number: Keystone,
    write_ahead: Mutex<WriteAheadBuffer>,
    published: Mutex<Published>,
    open: AtomicBool,
}

/// Embedded table store over fixed-width rows.
///
/// Open, mutate through `set_row`/`delete_row`, read through `get_row`,
/// and `close().await` when done. Must be opened within a tokio runtime:
/// the merge engine runs as a background task.
pub struct TableStore {
    inner: Arc<StoreInner>,
    merge_engine: TableMergeEngine,
}

impl TableStore {
    /// Opens the store at `config.root_dir`, creating it if absent and
    /// otherwise recovering the last committed state. Leftovers of an
    /// abnormal shutdown (a flushed-but-undiscarded write-ahead file, a
    /// half-flushed sorted table, an orphaned commit file) are repaired
    /// here and only here.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let root = config.root_dir.clone();
        std::fs::create_dir_all(&root)?;
        let lock = FileLock::acquire(root.join(LOCK_FILENAME))?;
        let trash_dir = root.join(TRASH_DIRNAME);

        // Counters: create-if-absent, else load. Three logical counters
        // share the one file at disjoint offsets.
        let counters_path = root.join(COUNTERS_FILENAME);
        let fresh = match std::fs::metadata(&counters_path) {
            Ok(meta) => meta.len() == 0,
            Err(_) => true,
        };
        let counter_file = Arc::new(
            OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&counters_path)?,
        );
        let (table_counter, commit_number, wal_table_number) = if fresh {
            let table_counter = Keystone::create(Arc::clone(&counter_file), 0, 0)?;
            let commit_number =
                Keystone::create(Arc::clone(&counter_file), table_counter.end_offset(), 0)?;
            let wal_table_number =
                Keystone::create(counter_file, commit_number.end_offset(), 0)?;
            (table_counter, commit_number, wal_table_number)
        } else {
            let table_counter = Keystone::load(Arc::clone(&counter_file), 0)?;
            let commit_number =
                Keystone::load(Arc::clone(&counter_file), table_counter.end_offset())?;
            let wal_table_number = Keystone::load(counter_file, commit_number.end_offset())?;
            (table_counter, commit_number, wal_table_number)
        };

        // Current commit; a crash mid-publish can leave the next commit's
        // file behind without the counter ever reaching it.
        let commit_id = commit_number.get();
        let commit = if commit_id == 0 {
            CommitRecord::init()
        } else {
            CommitRecord::load(&commit_path_in(&root, commit_id), commit_id)?
        };
        let orphan = commit_path_in(&root, commit_id + 1);
        if orphan.exists() {
            tracing::warn!(
                commit_id = commit_id + 1,
                "discarding uncommitted commit file left by abnormal shutdown"
            );
            discard_into(&trash_dir, &orphan)?;
        }

        let table_set = load_table_set(&config, &commit)?;

        // Write-ahead recovery.
        let wal_id = wal_table_number.get();
        let mut write_ahead = None;
        if wal_id != 0 {
            let wal_path = write_ahead_path_in(&root, wal_id);
            if wal_path.exists() {
                if commit.table_ids().contains(&wal_id) {
                    // Flushed, committed, then interrupted before discard.
                    tracing::warn!(
                        wal_id,
                        "recovering from abnormal shutdown; write-ahead file already flushed"
                    );
                    discard_into(&trash_dir, &wal_path)?;
                } else {
                    let stale = sorted_table_path_in(&root, wal_id);
                    if stale.exists() {
                        tracing::warn!(
                            wal_id,
                            "removing half-flushed sorted table left by abnormal shutdown"
                        );
                        std::fs::remove_file(&stale)?;
                    }
                    write_ahead = Some(WriteAheadBuffer::reopen(
                        &wal_path,
                        config.row_width,
                        Arc::clone(&config.row_order),
                        wal_id,
                    )?);
                }
            }
        }
        let write_ahead = match write_ahead {
            Some(buffer) => buffer,
            None => new_write_ahead(&config, &table_counter, &wal_table_number)?,
        };

        let policy = config.merge_policy.clone();
        let delete_codec = config.delete_codec.clone();
        let inner = Arc::new(StoreInner {
            config,
            _lock: lock,
            trash_dir,
            table_counter,
            commit_number,
            wal_table_number,
            write_ahead: Mutex::new(write_ahead),
            published: Mutex::new(Published {
                table_set: Arc::new(table_set),
                commit,
            }),
            open: AtomicBool::new(true),
        });

        let merge_engine = TableMergeEngine::start(
            Arc::clone(&inner) as Arc<dyn MergeContext>,
            policy,
            delete_codec,
        );
        // Nudge once so a backlog left by a crash compacts without
        // waiting for the next flush.
        merge_engine.notify_fresh_meat();

        tracing::info!(
            root = %inner.config.root_dir.display(),
            commit_id = inner.commit_number.get(),
            "opened table store"
        );
        Ok(Self {
            inner,
            merge_engine,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Last-written row for `key`, or `None` if absent or tombstoned.
    pub fn get_row(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.check_open()?;
        self.inner.check_key(key)?;

        let row = {
            let wal = self.inner.write_ahead.lock().unwrap();
            match wal.get_row(key) {
                Some(row) => Some(row),
                None => self.inner.snapshot_table_set().raw_row(key)?,
            }
        };
        Ok(match (row, &self.inner.config.delete_codec) {
            (Some(row), Some(codec)) if codec.is_deleted(&row) => None,
            (row, _) => row,
        })
    }

    /// Writes `row` (exactly `row_width` bytes), overwriting any earlier
    /// row with the same key. Crossing the flush trigger flushes the
    /// write-ahead buffer to a new sorted table and commits it.
    pub fn set_row(&self, row: &[u8]) -> Result<()> {
        self.inner.check_open()?;
        if row.len() != self.inner.config.row_width {
            return Err(Error::Config(format!(
                "row of {} bytes in a store with row width {}",
                row.len(),
                self.inner.config.row_width
            )));
        }

        let flushed = {
            let mut wal = self.inner.write_ahead.lock().unwrap();
            wal.put_row(row)?;
            self.inner.manage_write_ahead(&mut wal)?
        };
        if flushed {
            self.merge_engine.notify_fresh_meat();
        }
        Ok(())
    }

    /// Deletes `key` by writing a tombstone row. Requires a delete codec.
    ///
    /// With `check_exists`, an absent key is a no-op, and a key living
    /// only in the write-ahead buffer (with nothing on disk that could
    /// resurrect it) is dropped in memory instead of tombstoned.
    pub fn delete_row(&self, key: &[u8], check_exists: bool) -> Result<()> {
        self.inner.check_open()?;
        self.inner.check_key(key)?;
        let config = &self.inner.config;
        let Some(codec) = &config.delete_codec else {
            return Err(Error::Config(
                "deletes require a delete codec".to_string(),
            ));
        };

        let key_width = config.key_width();
        let mut tombstone = vec![0u8; config.row_width];
        tombstone[..key_width].copy_from_slice(&key[..key_width]);
        codec.mark_deleted(&mut tombstone);

        let flushed = {
            let mut wal = self.inner.write_ahead.lock().unwrap();
            let mut removed_in_buffer = false;
            if check_exists {
                let wal_row = wal.get_row(key);
                if let Some(row) = &wal_row {
                    if codec.is_deleted(row) {
                        return Ok(());
                    }
                }
                let back_row = self.inner.snapshot_table_set().get_row(key)?;
                match (&wal_row, &back_row) {
                    (None, None) => return Ok(()),
                    (Some(_), None) => {
                        // Live only in the buffer: drop it there, keep
                        // the tombstone out of the flush.
                        wal.write_ahead_but_remove(&tombstone)?;
                        removed_in_buffer = true;
                    }
                    _ => {}
                }
            }
            if !removed_in_buffer {
                wal.put_row(&tombstone)?;
            }
            self.inner.manage_write_ahead(&mut wal)?
        };
        if flushed {
            self.merge_engine.notify_fresh_meat();
        }
        Ok(())
    }

    /// Commit id of the currently published state.
    pub fn current_commit_id(&self) -> u64 {
        self.inner.commit_number.get()
    }

    /// The commit record of the current back set.
    pub fn commit_record(&self) -> CommitRecord {
        self.inner.published.lock().unwrap().commit.clone()
    }

    /// Size in bytes of an existing sorted-table file.
    pub fn table_file_size(&self, table_id: u64) -> Result<u64> {
        let path = sorted_table_path_in(&self.inner.config.root_dir, table_id);
        let meta = std::fs::metadata(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::NotFound(format!("sorted table file {}", path.display()))
            }
            _ => Error::Io(e),
        })?;
        Ok(meta.len())
    }

    /// Opens a fresh read-only instance of an existing sorted table. The
    /// caller must eventually close it.
    pub fn load_sorted_table(&self, table_id: u64) -> Result<SortedTable> {
        self.inner.load_sorted_table_file(table_id)
    }

    /// Closes the store: stops the merge engine (no merge runs after
    /// shutdown begins), flushes and commits a non-empty write-ahead
    /// buffer, and releases every table handle.
    pub async fn close(self) {
        self.merge_engine.close().await;

        let inner = &self.inner;
        let mut wal = inner.write_ahead.lock().unwrap();
        let mut published = inner.published.lock().unwrap();
        if inner.open.swap(false, Ordering::SeqCst) {
            // Best effort: a failure here is logged, shutdown proceeds,
            // and the surviving .utbl file replays at the next open.
            if let Err(e) = inner.commit_write_ahead_on_close(&mut wal, &mut published) {
                tracing::error!(error = %e, "failed to commit write-ahead buffer on close");
            }
            published.table_set.close();
            tracing::info!(
                root = %inner.config.root_dir.display(),
                "closed table store"
            );
        }
    }
}

impl Drop for TableStore {
    fn drop(&mut self) {
        if self.inner.open.swap(false, Ordering::SeqCst) {
            tracing::warn!("table store dropped without close");
        }
    }
}

impl StoreInner {
    fn check_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::InvalidState("store is closed".to_string()))
        }
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() < self.config.key_width() {
            return Err(Error::Config(format!(
                "key of {} bytes in a store with key width {}",
                key.len(),
                self.config.key_width()
            )));
        }
        Ok(())
    }

    fn snapshot_table_set(&self) -> Arc<TableSet> {
        Arc::clone(&self.published.lock().unwrap().table_set)
    }

    fn sorted_table_path(&self, table_id: u64) -> PathBuf {
        sorted_table_path_in(&self.config.root_dir, table_id)
    }

    fn commit_path(&self, commit_id: u64) -> PathBuf {
        commit_path_in(&self.config.root_dir, commit_id)
    }

    fn discard_file(&self, path: &Path) -> Result<()> {
        discard_into(&self.trash_dir, path)
    }

    fn load_sorted_table_file(&self, table_id: u64) -> Result<SortedTable> {
        SortedTable::open(
            &self.sorted_table_path(table_id),
            self.config.row_width,
            Arc::clone(&self.config.row_order),
            table_id,
        )
    }

    fn next_write_ahead(&self) -> Result<WriteAheadBuffer> {
        new_write_ahead(&self.config, &self.table_counter, &self.wal_table_number)
    }

    /// Flushes the write-ahead buffer once it crosses the flush trigger:
    /// sorted table out, new commit written, counter advanced, table set
    /// swapped, superseded files trashed, fresh buffer allocated. Returns
    /// whether a flush happened (the caller then notifies the merge
    /// engine).
    fn manage_write_ahead(&self, wal: &mut WriteAheadBuffer) -> Result<bool> {
        if wal.wal_size() < self.config.merge_policy.write_ahead_flush_trigger {
            return Ok(false);
        }
        if wal.is_empty() {
            // Everything buffered was removed again; nothing to flush.
            let path = wal.path().to_path_buf();
            wal.close();
            self.discard_file(&path)?;
            *wal = self.next_write_ahead()?;
            return Ok(false);
        }

        let mut published = self.published.lock().unwrap();
        let wal_id = wal.id();
        if wal_id != self.wal_table_number.get() {
            return Err(Error::InvalidState(format!(
                "write-ahead buffer id {} doesn't match counter {}",
                wal_id,
                self.wal_table_number.get()
            )));
        }

        let table_path = self.sorted_table_path(wal_id);
        let mut writer = TableWriter::create(&table_path, self.config.row_width)?;
        let rows = wal.flush(&mut writer)?;
        writer.finish()?;

        let mut table_ids = published.table_set.table_ids();
        table_ids.push(wal_id);
        let commit_id = self.commit_number.get() + 1;
        let commit = self.write_commit(commit_id, table_ids)?;

        // Committed; everything from here is cleanup and swap.
        let wal_path = wal.path().to_path_buf();
        self.discard_file(&wal_path)?;
        if let Some(prev) = published.commit.path().map(Path::to_path_buf) {
            self.discard_file(&prev)?;
        }

        let table = Arc::new(self.load_sorted_table_file(wal_id)?);
        let new_set = published.table_set.append(table, commit_id)?;
        published.table_set = Arc::new(new_set);
        published.commit = commit;
        drop(published);

        tracing::info!(table_id = wal_id, commit_id, rows, "flushed write-ahead buffer");
        *wal = self.next_write_ahead()?;
        Ok(true)
    }

    /// Writes the commit file, then advances the counter, in that order,
    /// so a crash in between recovers to the prior commit. If advancing
    /// the counter fails the fresh commit file is removed again.
    fn write_commit(&self, commit_id: u64, table_ids: Vec<u64>) -> Result<CommitRecord> {
        let commit = CommitRecord::create(&self.commit_path(commit_id), table_ids, commit_id)?;
        if let Err(e) = self.commit_number.set(commit_id) {
            if let Some(path) = commit.path() {
                let _ = std::fs::remove_file(path);
            }
            return Err(e);
        }
        Ok(commit)
    }

    /// Splices a merge result over its source run and publishes the new
    /// commit. Invariant violations here mean the plan went stale or the
    /// bookkeeping is wrong; they fail fast and leave the store unchanged.
    fn process_merged(&self, source_ids: &[u64], result: SortedTable) -> Result<()> {
        if source_ids.len() < 2 {
            return Err(Error::InvalidState(format!(
                "merge published {} sources",
                source_ids.len()
            )));
        }
        if !result.is_open() {
            return Err(Error::InvalidState(format!(
                "merge result {} is not open",
                result.id()
            )));
        }
        if result.row_count() == 0 {
            return Err(Error::InvalidState(format!(
                "empty merge result {} must be discarded, not published",
                result.id()
            )));
        }
        let result = Arc::new(result);

        let mut published = self.published.lock().unwrap();
        if !self.open.load(Ordering::SeqCst) {
            result.close();
            return Ok(());
        }

        let spliced = (|| {
            let ids = published.table_set.table_ids();
            if ids.contains(&result.id()) {
                return Err(Error::InvalidState(format!(
                    "merge result id {} already present in commit {}",
                    result.id(),
                    published.commit.id()
                )));
            }
            let off = ids
                .iter()
                .position(|id| *id == source_ids[0])
                .ok_or_else(|| {
                    Error::InvalidState(format!(
                        "merge sources {:?} not found in commit {}",
                        source_ids,
                        published.commit.id()
                    ))
                })?;
            if off + source_ids.len() > ids.len()
                || ids[off..off + source_ids.len()] != *source_ids
            {
                return Err(Error::InvalidState(format!(
                    "merge sources {:?} are not a contiguous run of commit {}",
                    source_ids,
                    published.commit.id()
                )));
            }

            let pre = published.table_set.tables();
            let replaced = pre[off..off + source_ids.len()].to_vec();
            let mut stack = pre[..off].to_vec();
            stack.push(Arc::clone(&result));
            stack.extend_from_slice(&pre[off + source_ids.len()..]);

            let commit_id = self.commit_number.get() + 1;
            let new_set = TableSet::new(
                Arc::clone(&self.config.row_order),
                self.config.row_width,
                stack,
                self.config.delete_codec.clone(),
                commit_id,
            )?;
            let commit = self.write_commit(commit_id, new_set.table_ids())?;

            let prev_commit = std::mem::replace(&mut published.commit, commit);
            published.table_set = Arc::new(new_set);
            Ok((prev_commit, replaced))
        })();
        drop(published);

        let (prev_commit, replaced) = match spliced {
            Ok(spliced) => spliced,
            Err(e) => {
                result.close();
                return Err(e);
            }
        };

        // Committed; release and trash the superseded pieces.
        for table in &replaced {
            table.close();
            self.discard_file(&self.sorted_table_path(table.id()))?;
        }
        if let Some(prev) = prev_commit.path() {
            self.discard_file(prev)?;
        }
        tracing::info!(
            sources = ?source_ids,
            result = result.id(),
            commit_id = self.commit_number.get(),
            "published table merge"
        );
        Ok(())
    }

    /// Close-time counterpart of `manage_write_ahead`: flushes a
    /// non-empty buffer regardless of the trigger so a clean shutdown
    /// never depends on `.utbl` replay.
    fn commit_write_ahead_on_close(
        &self,
        wal: &mut WriteAheadBuffer,
        published: &mut Published,
    ) -> Result<()> {
        if wal.is_empty() {
            wal.close();
            return Ok(());
        }
        let wal_id = wal.id();
        if wal_id != self.wal_table_number.get() {
            return Err(Error::InvalidState(format!(
                "write-ahead buffer id {} doesn't match counter {}",
                wal_id,
                self.wal_table_number.get()
            )));
        }

        let table_path = self.sorted_table_path(wal_id);
        let mut writer = TableWriter::create(&table_path, self.config.row_width)?;
        let rows = wal.flush(&mut writer)?;
        writer.finish()?;

        let mut table_ids = published.table_set.table_ids();
        table_ids.push(wal_id);
        let commit_id = self.commit_number.get() + 1;
        let commit = self.write_commit(commit_id, table_ids)?;

        let wal_path = wal.path().to_path_buf();
        wal.close();
        self.discard_file(&wal_path)?;
        if let Some(prev) = published.commit.path().map(Path::to_path_buf) {
            self.discard_file(&prev)?;
        }
        published.commit = commit;

        tracing::info!(table_id = wal_id, commit_id, rows, "committed write-ahead buffer on close");
        Ok(())
    }
}

impl MergeContext for StoreInner {
    fn next_table_id(&self) -> Result<u64> {
        self.check_open()?;
        self.table_counter.increment(1)
    }

    fn table_path(&self, table_id: u64) -> PathBuf {
        self.sorted_table_path(table_id)
    }

    fn table_stack(&self) -> Option<Arc<TableSet>> {
        if !self.open.load(Ordering::SeqCst) {
            return None;
        }
        Some(self.snapshot_table_set())
    }

    fn tables_merged(&self, source_ids: &[u64], result: SortedTable) -> Result<()> {
        self.process_merged(source_ids, result)
    }
}

fn new_write_ahead(
    config: &StoreConfig,
    table_counter: &Keystone,
    wal_table_number: &Keystone,
) -> Result<WriteAheadBuffer> {
    let wal_id = table_counter.increment(1)?;
    wal_table_number.set(wal_id)?;
    let path = write_ahead_path_in(&config.root_dir, wal_id);
    if path.exists() {
        return Err(Error::InvalidState(format!(
            "fresh write-ahead file {} already exists",
            path.display()
        )));
    }
    WriteAheadBuffer::create(&path, config.row_width, Arc::clone(&config.row_order), wal_id)
}

fn load_table_set(config: &StoreConfig, commit: &CommitRecord) -> Result<TableSet> {
    let mut tables = Vec::with_capacity(commit.table_ids().len());
    for &table_id in commit.table_ids() {
        let path = sorted_table_path_in(&config.root_dir, table_id);
        tables.push(Arc::new(SortedTable::open(
            &path,
            config.row_width,
            Arc::clone(&config.row_order),
            table_id,
        )?));
    }
    TableSet::new(
        Arc::clone(&config.row_order),
        config.row_width,
        tables,
        config.delete_codec.clone(),
        commit.id(),
    )
}
