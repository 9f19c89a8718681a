//! Durable counters ("keystones") sharing one file at disjoint offsets.
//!
//! Each counter occupies a self-describing slot:
//!
//! ```text
//! +----------+------------------+
//! | width:u8 | value (BigEndian)|
//! +----------+------------------+
//! ```
//!
//! Slots are laid out sequentially; loading walks from a known offset and
//! each keystone reports where the next slot begins. `set`/`increment`
//! write through and fdatasync before returning, so a value read back
//! after a crash is always one that was actually committed. Reads are
//! served from an in-memory cache after the initial load.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

const VALUE_WIDTH: u8 = 8;

pub struct Keystone {
    file: Arc<File>,
    offset: u64,
    width: u8,
    cache: Mutex<u64>,
}

impl Keystone {
    /// Writes a fresh slot at `offset` holding `init` and syncs it.
    pub fn create(file: Arc<File>, offset: u64, init: u64) -> Result<Self> {
        let mut buf = [0u8; 1 + VALUE_WIDTH as usize];
        buf[0] = VALUE_WIDTH;
        (&mut buf[1..]).write_u64::<BigEndian>(init)?;
        file.write_all_at(&buf, offset)?;
        file.sync_data()?;
        Ok(Self {
            file,
            offset,
            width: VALUE_WIDTH,
            cache: Mutex::new(init),
        })
    }

    /// Loads the slot at `offset` written by a previous `create`.
    pub fn load(file: Arc<File>, offset: u64) -> Result<Self> {
        let mut width = [0u8; 1];
        file.read_exact_at(&mut width, offset)?;
        let width = width[0];
        if width == 0 || width > 8 {
            return Err(Error::Corrupt(format!(
                "keystone at offset {} has width {}",
                offset, width
            )));
        }
        let mut buf = vec![0u8; width as usize];
        file.read_exact_at(&mut buf, offset + 1)?;
        let mut value = 0u64;
        let mut cursor = &buf[..];
        for _ in 0..width {
            value = (value << 8) | cursor.read_u8()? as u64;
        }
        Ok(Self {
            file,
            offset,
            width,
            cache: Mutex::new(value),
        })
    }

    /// Offset of the byte following this slot; the next slot starts here.
    pub fn end_offset(&self) -> u64 {
        self.offset + 1 + self.width as u64
    }

    /// Current value, served from cache.
    pub fn get(&self) -> u64 {
        *self.cache.lock().unwrap()
    }

    /// Sets the value, synced to disk before returning.
    pub fn set(&self, value: u64) -> Result<()> {
        let mut cache = self.cache.lock().unwrap();
        self.write_value(value)?;
        *cache = value;
        Ok(())
    }

    /// Adds `delta` and returns the value after the increment.
    pub fn increment(&self, delta: u64) -> Result<u64> {
        let mut cache = self.cache.lock().unwrap();
        let value = *cache + delta;
        self.write_value(value)?;
        *cache = value;
        Ok(value)
    }

    fn write_value(&self, value: u64) -> Result<()> {
        let mut buf = Vec::with_capacity(self.width as usize);
        for shift in (0..self.width).rev() {
            buf.write_u8((value >> (shift * 8)) as u8)?;
        }
        self.file.write_all_at(&buf, self.offset + 1)?;
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    fn open_counter_file(path: &std::path::Path) -> Arc<File> {
        Arc::new(
            OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(path)
                .unwrap(),
        )
    }

    #[test]
    fn set_get_increment() -> Result<()> {
        let dir = tempdir().unwrap();
        let file = open_counter_file(&dir.path().join("tc.counts"));

        let ks = Keystone::create(file, 0, 0)?;
        assert_eq!(ks.get(), 0);

        ks.set(42)?;
        assert_eq!(ks.get(), 42);

        assert_eq!(ks.increment(1)?, 43);
        assert_eq!(ks.increment(7)?, 50);
        assert_eq!(ks.get(), 50);
        Ok(())
    }

    #[test]
    fn survives_reload() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tc.counts");

        {
            let file = open_counter_file(&path);
            let ks = Keystone::create(file, 0, 5)?;
            ks.increment(10)?;
        }

        let file = open_counter_file(&path);
        let ks = Keystone::load(file, 0)?;
        assert_eq!(ks.get(), 15);
        Ok(())
    }

    #[test]
    fn three_counters_share_one_file() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tc.counts");

        let (a_end, b_end) = {
            let file = open_counter_file(&path);
            let a = Keystone::create(file.clone(), 0, 1)?;
            let b = Keystone::create(file.clone(), a.end_offset(), 2)?;
            let c = Keystone::create(file, b.end_offset(), 3)?;
            a.set(100)?;
            c.increment(1)?;
            (a.end_offset(), b.end_offset())
        };

        let file = open_counter_file(&path);
        let a = Keystone::load(file.clone(), 0)?;
        let b = Keystone::load(file.clone(), a_end)?;
        let c = Keystone::load(file, b_end)?;
        assert_eq!(a.get(), 100);
        assert_eq!(b.get(), 2);
        assert_eq!(c.get(), 4);
        Ok(())
    }

    #[test]
    fn load_rejects_bad_width() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tc.counts");
        std::fs::write(&path, [9u8, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap();

        let file = open_counter_file(&path);
        assert!(matches!(Keystone::load(file, 0), Err(Error::Corrupt(_))));
    }
}
