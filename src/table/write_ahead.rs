//! Write-ahead buffer: the mutable staging area for recent writes.
//!
//! Live rows sit in a skip list keyed by the row's key region under the
//! configured order, so flushing streams them out already sorted. Every
//! accepted row is also appended to the buffer's `.utbl` file before the
//! in-memory update, which makes the buffer reopenable after a crash:
//! replaying the file front to back (last write per key wins) restores the
//! live rows.
//!
//! State machine: collecting → flushing → closed. Once flushed or closed
//! the buffer accepts no further writes.

use crossbeam_skiplist::SkipMap;
use std::cmp::Ordering;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::order::RowOrder;
use crate::table::sorted::TableWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    Collecting,
    Flushed,
    Closed,
}

/// Skip-list key: a row's key region, ordered by the store's row order.
struct BufferKey {
    key: Vec<u8>,
    order: Arc<dyn RowOrder>,
}

impl PartialEq for BufferKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for BufferKey {}

impl PartialOrd for BufferKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BufferKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order.compare(&self.key, &other.key)
    }
}

pub struct WriteAheadBuffer {
    id: u64,
    path: PathBuf,
    file: File,
    rows: SkipMap<BufferKey, Vec<u8>>,
    order: Arc<dyn RowOrder>,
    row_width: usize,
    wal_size: u64,
    state: BufferState,
}

impl WriteAheadBuffer {
    /// Creates a fresh buffer backed by a new `.utbl` file at `path`.
    pub fn create(
        path: &Path,
        row_width: usize,
        order: Arc<dyn RowOrder>,
        id: u64,
    ) -> Result<Self> {
        let file = OpenOptions::new().create_new(true).append(true).open(path)?;
        Ok(Self {
            id,
            path: path.to_path_buf(),
            file,
            rows: SkipMap::new(),
            order,
            row_width,
            wal_size: 0,
            state: BufferState::Collecting,
        })
    }

    /// Reopens a buffer from an existing `.utbl` file left by an earlier
    /// run, replaying it front to back. New writes append after the
    /// existing contents.
    pub fn reopen(
        path: &Path,
        row_width: usize,
        order: Arc<dyn RowOrder>,
        id: u64,
    ) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).append(true).open(path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        if contents.len() % row_width != 0 {
            return Err(Error::Corrupt(format!(
                "write-ahead file {} is {} bytes, not a multiple of row width {}",
                path.display(),
                contents.len(),
                row_width
            )));
        }

        let buffer = Self {
            id,
            path: path.to_path_buf(),
            file,
            rows: SkipMap::new(),
            order,
            row_width,
            wal_size: contents.len() as u64,
            state: BufferState::Collecting,
        };
        for row in contents.chunks_exact(row_width) {
            buffer.insert(row);
        }
        Ok(buffer)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes appended to the write-ahead file so far; the flush trigger
    /// compares against this.
    pub fn wal_size(&self) -> u64 {
        self.wal_size
    }

    /// Count of live (distinct-key) rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Last written row for `key`, if any.
    pub fn get_row(&self, key: &[u8]) -> Option<Vec<u8>> {
        let lookup = self.buffer_key(key);
        self.rows.get(&lookup).map(|entry| entry.value().clone())
    }

    /// Appends `row` to the write-ahead file and makes it the live row
    /// for its key.
    pub fn put_row(&mut self, row: &[u8]) -> Result<()> {
        self.append(row)?;
        self.insert(row);
        Ok(())
    }

    /// Records `tombstone` in the write-ahead file for crash consistency
    /// but drops the key from the live rows, so the flush will not
    /// persist it. Used when nothing on disk could resurrect the key.
    pub fn write_ahead_but_remove(&mut self, tombstone: &[u8]) -> Result<()> {
        self.append(tombstone)?;
        let lookup = self.buffer_key(tombstone);
        self.rows.remove(&lookup);
        Ok(())
    }

    /// Streams the live rows, already sorted, into `writer`. The buffer
    /// accepts no further writes afterwards.
    pub fn flush(&mut self, writer: &mut TableWriter) -> Result<u64> {
        self.check_collecting()?;
        self.state = BufferState::Flushed;
        let mut rows = 0;
        for entry in self.rows.iter() {
            writer.append(entry.value())?;
            rows += 1;
        }
        Ok(rows)
    }

    pub fn close(&mut self) {
        self.state = BufferState::Closed;
    }

    fn append(&mut self, row: &[u8]) -> Result<()> {
        self.check_collecting()?;
        if row.len() != self.row_width {
            return Err(Error::Config(format!(
                "row of {} bytes in a store with row width {}",
                row.len(),
                self.row_width
            )));
        }
        self.file.write_all(row)?;
        self.wal_size += row.len() as u64;
        Ok(())
    }

    fn insert(&self, row: &[u8]) {
        let key = self.buffer_key(row);
        self.rows.insert(key, row.to_vec());
    }

    fn buffer_key(&self, row_or_key: &[u8]) -> BufferKey {
        BufferKey {
            key: row_or_key[..self.order.key_width()].to_vec(),
            order: Arc::clone(&self.order),
        }
    }

    fn check_collecting(&self) -> Result<()> {
        match self.state {
            BufferState::Collecting => Ok(()),
            BufferState::Flushed => Err(Error::InvalidState(format!(
                "write-ahead buffer {} already flushed",
                self.id
            ))),
            BufferState::Closed => Err(Error::InvalidState(format!(
                "write-ahead buffer {} is closed",
                self.id
            ))),
        }
    }
}

impl std::fmt::Debug for WriteAheadBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadBuffer")
            .field("id", &self.id)
            .field("rows", &self.rows.len())
            .field("wal_size", &self.wal_size)
            .field("state", &self.state)
            .finish()
    }
}
