//! Offset records
//!
//! Maps digest-key fingerprints to regions of the data file. The file
//! store is a direct-mapped table of fixed 32-byte records; a colliding
//! insert overwrites its victim, which then simply re-uploads. Records
//! are only believed when their region is still inside the live window.

use super::state_store::Cursors;
use crate::blobstore::StorageResult;
use byteorder::{ByteOrder, LittleEndian};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Region of the data file holding a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetRecord {
    pub offset: u64,
    pub size_bytes: u64,
}

pub trait OffsetStore: Send {
    fn get(&mut self, key: u128, cursors: Cursors) -> StorageResult<Option<OffsetRecord>>;
    fn put(&mut self, key: u128, record: OffsetRecord, cursors: Cursors) -> StorageResult<()>;
}

const RECORD_SIZE: u64 = 32;

/// Direct-mapped persistent record table.
pub struct FileOffsetStore {
    file: File,
    record_count: u64,
}

impl FileOffsetStore {
    pub fn open(path: &Path, size_bytes: u64) -> StorageResult<Self> {
        let record_count = (size_bytes / RECORD_SIZE).max(1);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(record_count * RECORD_SIZE)?;
        Ok(Self { file, record_count })
    }

    fn slot_offset(&self, key: u128) -> u64 {
        (key as u64 % self.record_count) * RECORD_SIZE
    }
}

impl OffsetStore for FileOffsetStore {
    fn get(&mut self, key: u128, cursors: Cursors) -> StorageResult<Option<OffsetRecord>> {
        let mut record = [0u8; RECORD_SIZE as usize];
        self.file.read_exact_at(&mut record, self.slot_offset(key))?;
        let stored_key = LittleEndian::read_u128(&record[0..16]);
        if stored_key != key {
            return Ok(None);
        }
        let offset = LittleEndian::read_u64(&record[16..24]);
        let size_bytes = LittleEndian::read_u64(&record[24..32]);
        if !cursors.contains(offset, size_bytes) {
            return Ok(None);
        }
        Ok(Some(OffsetRecord { offset, size_bytes }))
    }

    fn put(&mut self, key: u128, record: OffsetRecord, _cursors: Cursors) -> StorageResult<()> {
        let mut bytes = [0u8; RECORD_SIZE as usize];
        LittleEndian::write_u128(&mut bytes[0..16], key);
        LittleEndian::write_u64(&mut bytes[16..24], record.offset);
        LittleEndian::write_u64(&mut bytes[24..32], record.size_bytes);
        self.file.write_all_at(&bytes, self.slot_offset(key))?;
        Ok(())
    }
}

#[derive(Clone, Copy)]
struct CacheEntry {
    key: u128,
    record: OffsetRecord,
}

/// Write-through in-memory cache in front of an offset store.
pub struct CachingOffsetStore<S> {
    inner: S,
    cache: Vec<Option<CacheEntry>>,
}

impl<S: OffsetStore> CachingOffsetStore<S> {
    pub fn new(inner: S, cache_size: usize) -> Self {
        Self {
            inner,
            cache: vec![None; cache_size.max(1)],
        }
    }

    fn cache_index(&self, key: u128) -> usize {
        (key as u64 % self.cache.len() as u64) as usize
    }
}

impl<S: OffsetStore> OffsetStore for CachingOffsetStore<S> {
    fn get(&mut self, key: u128, cursors: Cursors) -> StorageResult<Option<OffsetRecord>> {
        let index = self.cache_index(key);
        if let Some(entry) = self.cache[index] {
            if entry.key == key {
                if cursors.contains(entry.record.offset, entry.record.size_bytes) {
                    return Ok(Some(entry.record));
                }
                return Ok(None);
            }
        }
        let looked_up = self.inner.get(key, cursors)?;
        if let Some(record) = looked_up {
            self.cache[index] = Some(CacheEntry { key, record });
        }
        Ok(looked_up)
    }

    fn put(&mut self, key: u128, record: OffsetRecord, cursors: Cursors) -> StorageResult<()> {
        self.inner.put(key, record, cursors)?;
        let index = self.cache_index(key);
        self.cache[index] = Some(CacheEntry { key, record });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn wide_open() -> Cursors {
        Cursors {
            read: 0,
            write: u64::MAX,
        }
    }

    #[test]
    fn test_put_get_roundtrip() {
        let temp = TempDir::new().unwrap();
        let mut store = FileOffsetStore::open(&temp.path().join("offsets"), 4096).unwrap();
        let record = OffsetRecord {
            offset: 123,
            size_bytes: 456,
        };
        store.put(0xabcdef, record, wide_open()).unwrap();
        assert_eq!(store.get(0xabcdef, wide_open()).unwrap(), Some(record));
        assert_eq!(store.get(0x123456, wide_open()).unwrap(), None);
    }

    #[test]
    fn test_stale_record_is_invisible() {
        let temp = TempDir::new().unwrap();
        let mut store = FileOffsetStore::open(&temp.path().join("offsets"), 4096).unwrap();
        let record = OffsetRecord {
            offset: 10,
            size_bytes: 20,
        };
        store.put(7, record, wide_open()).unwrap();
        let cursors = Cursors {
            read: 50,
            write: 100,
        };
        assert_eq!(store.get(7, cursors).unwrap(), None);
    }

    #[test]
    fn test_colliding_insert_overwrites() {
        let temp = TempDir::new().unwrap();
        // One record only: every key collides.
        let mut store = FileOffsetStore::open(&temp.path().join("offsets"), 32).unwrap();
        let first = OffsetRecord {
            offset: 1,
            size_bytes: 2,
        };
        let second = OffsetRecord {
            offset: 3,
            size_bytes: 4,
        };
        store.put(100, first, wide_open()).unwrap();
        store.put(200, second, wide_open()).unwrap();
        assert_eq!(store.get(100, wide_open()).unwrap(), None);
        assert_eq!(store.get(200, wide_open()).unwrap(), Some(second));
    }

    #[test]
    fn test_cache_serves_and_writes_through() {
        let temp = TempDir::new().unwrap();
        let inner = FileOffsetStore::open(&temp.path().join("offsets"), 4096).unwrap();
        let mut store = CachingOffsetStore::new(inner, 16);
        let record = OffsetRecord {
            offset: 5,
            size_bytes: 6,
        };
        store.put(42, record, wide_open()).unwrap();
        assert_eq!(store.get(42, wide_open()).unwrap(), Some(record));
        // The write went through to the file as well.
        assert_eq!(store.inner.get(42, wide_open()).unwrap(), Some(record));
    }

    #[test]
    fn test_cache_respects_cursors() {
        let temp = TempDir::new().unwrap();
        let inner = FileOffsetStore::open(&temp.path().join("offsets"), 4096).unwrap();
        let mut store = CachingOffsetStore::new(inner, 16);
        store
            .put(
                42,
                OffsetRecord {
                    offset: 5,
                    size_bytes: 6,
                },
                wide_open(),
            )
            .unwrap();
        let cursors = Cursors {
            read: 100,
            write: 200,
        };
        assert_eq!(store.get(42, cursors).unwrap(), None);
    }
}
