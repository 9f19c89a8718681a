//! Immutable sorted tables.
//!
//! A sorted table is one headerless file of exactly `row_count × row_width`
//! bytes: fixed-width rows concatenated in ascending row order, no gaps.
//! Tables are write-once; `TableWriter` builds the file, `SortedTable`
//! serves reads. Lookups binary-search the file with positional reads, so
//! any number of concurrent readers can share one handle.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::order::RowOrder;

/// Rows fetched per read while iterating.
const ITER_CHUNK_ROWS: u64 = 256;

/// Read-only, binary-searchable view over one immutable table file.
///
/// `close()` releases the file descriptor even while clones of the
/// surrounding `Arc` are still held; any later use fails fast.
pub struct SortedTable {
    id: u64,
    row_width: usize,
    row_count: u64,
    order: Arc<dyn RowOrder>,
    file: RwLock<Option<File>>,
}

impl SortedTable {
    /// Opens an existing table file. The file size must be an exact
    /// multiple of the row width; anything else is corruption.
    pub fn open(
        path: &Path,
        row_width: usize,
        order: Arc<dyn RowOrder>,
        id: u64,
    ) -> Result<Self> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::NotFound(format!("sorted table file {}", path.display()))
            }
            _ => Error::Io(e),
        })?;
        let len = file.metadata()?.len();
        if len % row_width as u64 != 0 {
            return Err(Error::Corrupt(format!(
                "table file {} is {} bytes, not a multiple of row width {}",
                path.display(),
                len,
                row_width
            )));
        }
        Ok(Self {
            id,
            row_width,
            row_count: len / row_width as u64,
            order,
            file: RwLock::new(Some(file)),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn row_width(&self) -> usize {
        self.row_width
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Total bytes of row data in the backing file.
    pub fn byte_size(&self) -> u64 {
        self.row_count * self.row_width as u64
    }

    pub fn order(&self) -> &Arc<dyn RowOrder> {
        &self.order
    }

    pub fn is_open(&self) -> bool {
        self.file.read().unwrap().is_some()
    }

    /// Binary search for the row whose key region equals `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let guard = self.file.read().unwrap();
        let file = guard
            .as_ref()
            .ok_or_else(|| self.closed_error())?;

        let mut row = vec![0u8; self.row_width];
        let mut lo = 0u64;
        let mut hi = self.row_count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            file.read_exact_at(&mut row, mid * self.row_width as u64)?;
            match self.order.compare(key, &row) {
                std::cmp::Ordering::Equal => return Ok(Some(row)),
                std::cmp::Ordering::Less => hi = mid,
                std::cmp::Ordering::Greater => lo = mid + 1,
            }
        }
        Ok(None)
    }

    /// Reads `count` rows starting at row `index` into `buf` (resized to
    /// fit). Used by iterators; `index + count` must not exceed the row
    /// count.
    fn read_rows(&self, index: u64, count: u64, buf: &mut Vec<u8>) -> Result<()> {
        let guard = self.file.read().unwrap();
        let file = guard
            .as_ref()
            .ok_or_else(|| self.closed_error())?;
        buf.resize((count as usize) * self.row_width, 0);
        file.read_exact_at(buf, index * self.row_width as u64)?;
        Ok(())
    }

    /// Releases the file descriptor. Idempotent; reads after close fail
    /// fast with an invalid-state error.
    pub fn close(&self) {
        self.file.write().unwrap().take();
    }

    fn closed_error(&self) -> Error {
        Error::InvalidState(format!("sorted table {} is closed", self.id))
    }
}

impl std::fmt::Debug for SortedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedTable")
            .field("id", &self.id)
            .field("row_width", &self.row_width)
            .field("row_count", &self.row_count)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Ascending iterator over a sorted table, reading a chunk of rows per
/// disk access. Each instance is a fresh, restartable pass over the
/// table's fixed snapshot; the iterator keeps its table alive.
pub struct SortedTableIter {
    table: Arc<SortedTable>,
    next_row: u64,
    buf: Vec<u8>,
    buf_pos: usize,
}

impl SortedTableIter {
    pub fn new(table: Arc<SortedTable>) -> Self {
        Self {
            table,
            next_row: 0,
            buf: Vec::new(),
            buf_pos: 0,
        }
    }
}

impl Iterator for SortedTableIter {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let row_width = self.table.row_width;
        if self.buf_pos >= self.buf.len() {
            let remaining = self.table.row_count - self.next_row;
            if remaining == 0 {
                return None;
            }
            let count = remaining.min(ITER_CHUNK_ROWS);
            if let Err(e) = self.table.read_rows(self.next_row, count, &mut self.buf) {
                // Poison the iterator: later calls see no remaining rows.
                self.next_row = self.table.row_count;
                self.buf.clear();
                self.buf_pos = 0;
                return Some(Err(e));
            }
            self.next_row += count;
            self.buf_pos = 0;
        }
        let row = self.buf[self.buf_pos..self.buf_pos + row_width].to_vec();
        self.buf_pos += row_width;
        Some(Ok(row))
    }
}

/// Streams rows into a new table file. The file is created exclusively;
/// `finish` flushes and syncs it. An abandoned writer's partial file must
/// be discarded by the caller.
pub struct TableWriter {
    out: BufWriter<File>,
    path: PathBuf,
    row_width: usize,
    row_count: u64,
}

impl TableWriter {
    pub fn create(path: &Path, row_width: usize) -> Result<Self> {
        let file = OpenOptions::new().create_new(true).write(true).open(path)?;
        Ok(Self {
            out: BufWriter::new(file),
            path: path.to_path_buf(),
            row_width,
            row_count: 0,
        })
    }

    /// Appends one row. Rows must arrive in ascending row order; the
    /// writer does not re-sort.
    pub fn append(&mut self, row: &[u8]) -> Result<()> {
        if row.len() != self.row_width {
            return Err(Error::InvalidState(format!(
                "row of {} bytes appended to table with row width {}",
                row.len(),
                self.row_width
            )));
        }
        self.out.write_all(row)?;
        self.row_count += 1;
        Ok(())
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes and syncs the file, returning the rows written.
    pub fn finish(mut self) -> Result<u64> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(self.row_count)
    }

    /// Drops the writer and removes its partial file.
    pub fn discard(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(&path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::LexOrder;
    use tempfile::tempdir;

    fn row(key: u32, value: u32) -> Vec<u8> {
        let mut row = key.to_be_bytes().to_vec();
        row.extend_from_slice(&value.to_be_bytes());
        row
    }

    fn write_table(path: &Path, rows: &[(u32, u32)]) -> Result<Arc<SortedTable>> {
        let mut writer = TableWriter::create(path, 8)?;
        for (k, v) in rows {
            writer.append(&row(*k, *v))?;
        }
        writer.finish()?;
        Ok(Arc::new(SortedTable::open(
            path,
            8,
            Arc::new(LexOrder::new(4)),
            1,
        )?))
    }

    #[test]
    fn get_hits_and_misses() -> Result<()> {
        let dir = tempdir().unwrap();
        let table = write_table(
            &dir.path().join("T1.stbl"),
            &[(2, 20), (5, 50), (9, 90), (14, 140)],
        )?;

        assert_eq!(table.row_count(), 4);
        assert_eq!(table.get(&5u32.to_be_bytes())?, Some(row(5, 50)));
        assert_eq!(table.get(&2u32.to_be_bytes())?, Some(row(2, 20)));
        assert_eq!(table.get(&14u32.to_be_bytes())?, Some(row(14, 140)));
        assert_eq!(table.get(&3u32.to_be_bytes())?, None);
        assert_eq!(table.get(&99u32.to_be_bytes())?, None);
        Ok(())
    }

    #[test]
    fn iterates_in_order() -> Result<()> {
        let dir = tempdir().unwrap();
        let keys: Vec<(u32, u32)> = (0..1000).map(|i| (i * 3, i)).collect();
        let table = write_table(&dir.path().join("T1.stbl"), &keys)?;

        let rows: Vec<Vec<u8>> = SortedTableIter::new(Arc::clone(&table)).collect::<Result<_>>()?;
        assert_eq!(rows.len(), 1000);
        for (i, r) in rows.iter().enumerate() {
            assert_eq!(r, &row(i as u32 * 3, i as u32));
        }

        // Iterators restart; a second pass sees the same snapshot.
        assert_eq!(SortedTableIter::new(Arc::clone(&table)).count(), 1000);
        Ok(())
    }

    #[test]
    fn empty_table() -> Result<()> {
        let dir = tempdir().unwrap();
        let table = write_table(&dir.path().join("T1.stbl"), &[])?;
        assert_eq!(table.row_count(), 0);
        assert_eq!(table.get(&1u32.to_be_bytes())?, None);
        assert_eq!(SortedTableIter::new(table).count(), 0);
        Ok(())
    }

    #[test]
    fn rejects_misaligned_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("T1.stbl");
        std::fs::write(&path, [0u8; 13]).unwrap();

        let result = SortedTable::open(&path, 8, Arc::new(LexOrder::new(4)), 1);
        assert!(matches!(result, Err(Error::Corrupt(_))));
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let result = SortedTable::open(
            &dir.path().join("T9.stbl"),
            8,
            Arc::new(LexOrder::new(4)),
            9,
        );
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn close_is_idempotent_and_fails_fast() -> Result<()> {
        let dir = tempdir().unwrap();
        let table = write_table(&dir.path().join("T1.stbl"), &[(1, 10)])?;

        assert!(table.is_open());
        table.close();
        table.close();
        assert!(!table.is_open());
        assert!(matches!(
            table.get(&1u32.to_be_bytes()),
            Err(Error::InvalidState(_))
        ));
        Ok(())
    }

    #[test]
    fn discarded_writer_leaves_no_file() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("T1.stbl");
        let mut writer = TableWriter::create(&path, 8)?;
        writer.append(&row(1, 1))?;
        writer.discard()?;
        assert!(!path.exists());
        Ok(())
    }
}
