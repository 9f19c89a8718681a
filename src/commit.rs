//! Commit records: the durable list of sorted-table ids forming one
//! consistent snapshot of the store.
//!
//! Each non-zero commit lives in its own `C<id>.cmmt` file and is
//! immutable once written; superseding a commit means writing a new file
//! under the next id and only then discarding the old one. Commit id 0 is
//! the implicit initial commit: no file, no tables.
//!
//! # File Format
//!
//! ```text
//! +-----------+--------+-----------+-------------+-----------+
//! |length:u32 | id:u64 | count:u32 | table_id*:u64| crc32:u32 |
//! +-----------+--------+-----------+-------------+-----------+
//! ```
//!
//! All integers big-endian; the checksum covers the payload between the
//! length and the crc.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Debug, Clone)]
pub struct CommitRecord {
    id: u64,
    table_ids: Vec<u64>,
    path: Option<PathBuf>,
}

impl CommitRecord {
    /// The implicit empty commit (id 0). Has no backing file.
    pub fn init() -> Self {
        Self {
            id: 0,
            table_ids: Vec::new(),
            path: None,
        }
    }

    /// Writes and syncs a new commit file at `path`, then returns a handle.
    ///
    /// Fails if `path` already exists: commit files are never overwritten.
    pub fn create(path: &Path, table_ids: Vec<u64>, id: u64) -> Result<Self> {
        if id == 0 {
            return Err(Error::InvalidState(
                "commit id 0 is reserved for the initial commit".to_string(),
            ));
        }
        let mut payload = Vec::with_capacity(12 + table_ids.len() * 8);
        payload.write_u64::<BigEndian>(id)?;
        payload.write_u32::<BigEndian>(table_ids.len() as u32)?;
        for table_id in &table_ids {
            payload.write_u64::<BigEndian>(*table_id)?;
        }

        let mut file = OpenOptions::new().create_new(true).write(true).open(path)?;
        file.write_u32::<BigEndian>(payload.len() as u32)?;
        file.write_all(&payload)?;
        file.write_u32::<BigEndian>(CRC32.checksum(&payload))?;
        file.sync_all()?;

        Ok(Self {
            id,
            table_ids,
            path: Some(path.to_path_buf()),
        })
    }

    /// Loads the commit file at `path`, validating framing, checksum, and
    /// that the recorded id matches the expected one.
    pub fn load(path: &Path, id: u64) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::NotFound(format!("commit file {}", path.display()))
            }
            _ => Error::Io(e),
        })?;

        let len = file.read_u32::<BigEndian>()? as usize;
        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload)?;
        let checksum = file.read_u32::<BigEndian>()?;
        if checksum != CRC32.checksum(&payload) {
            return Err(Error::Corrupt(format!(
                "commit file {} fails checksum",
                path.display()
            )));
        }

        let mut cursor = Cursor::new(payload);
        let recorded_id = cursor.read_u64::<BigEndian>()?;
        if recorded_id != id {
            return Err(Error::Corrupt(format!(
                "commit file {} records id {}, expected {}",
                path.display(),
                recorded_id,
                id
            )));
        }
        let count = cursor.read_u32::<BigEndian>()? as usize;
        let mut table_ids = Vec::with_capacity(count);
        for _ in 0..count {
            table_ids.push(cursor.read_u64::<BigEndian>()?);
        }

        Ok(Self {
            id,
            table_ids,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Ordered table ids, oldest first.
    pub fn table_ids(&self) -> &[u64] {
        &self.table_ids
    }

    /// Backing file; `None` for the initial commit.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
