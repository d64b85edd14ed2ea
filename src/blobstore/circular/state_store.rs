//! Cursor state
//!
//! The read/write cursors are absolute 64-bit positions; the live window
//! of the data file is `[read, write)`. They are persisted on every
//! change so a restart replays at most the unpersisted tail.

use crate::blobstore::{StorageError, StorageResult};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// The live window of the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursors {
    pub read: u64,
    pub write: u64,
}

impl Cursors {
    /// Whether a region is still entirely inside the live window.
    pub fn contains(&self, offset: u64, size_bytes: u64) -> bool {
        offset >= self.read
            && offset
                .checked_add(size_bytes)
                .map_or(false, |end| end <= self.write)
    }
}

/// Allocation and invalidation over the cursor pair.
pub trait StateStore: Send {
    fn get_cursors(&self) -> Cursors;

    /// Advance the write cursor by `size_bytes`, dragging the read cursor
    /// along to keep the window within capacity. Returns the offset of
    /// the reserved region.
    fn allocate(&mut self, size_bytes: u64) -> StorageResult<u64>;

    /// Move the read cursor past a corrupted region.
    fn invalidate(&mut self, offset: u64, size_bytes: u64) -> StorageResult<()>;
}

const STATE_RECORD_SIZE: usize = 16;

/// Cursor pair persisted in a small file.
pub struct FileStateStore {
    file: File,
    capacity: u64,
    cursors: Cursors,
}

impl FileStateStore {
    pub fn open(path: &Path, capacity: u64) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let mut record = [0u8; STATE_RECORD_SIZE];
        let cursors = match file.read_exact_at(&mut record, 0) {
            Ok(()) => {
                let read = LittleEndian::read_u64(&record[0..8]);
                let write = LittleEndian::read_u64(&record[8..16]);
                if read > write || write - read > capacity {
                    log::warn!(
                        "state file holds inconsistent cursors ({}, {}), starting empty",
                        read,
                        write
                    );
                    Cursors { read: 0, write: 0 }
                } else {
                    Cursors { read, write }
                }
            }
            Err(_) => Cursors { read: 0, write: 0 },
        };
        let mut store = Self {
            file,
            capacity,
            cursors,
        };
        store.persist()?;
        Ok(store)
    }

    fn persist(&mut self) -> StorageResult<()> {
        let mut record = [0u8; STATE_RECORD_SIZE];
        LittleEndian::write_u64(&mut record[0..8], self.cursors.read);
        LittleEndian::write_u64(&mut record[8..16], self.cursors.write);
        self.file.write_all_at(&record, 0)?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn get_cursors(&self) -> Cursors {
        self.cursors
    }

    fn allocate(&mut self, size_bytes: u64) -> StorageResult<u64> {
        let offset = self.cursors.write;
        self.cursors.write = self.cursors.write.checked_add(size_bytes).ok_or_else(|| {
            StorageError::Internal("write cursor overflowed".to_string())
        })?;
        if self.cursors.write - self.cursors.read > self.capacity {
            self.cursors.read = self.cursors.write - self.capacity;
        }
        self.persist()?;
        Ok(offset)
    }

    fn invalidate(&mut self, offset: u64, size_bytes: u64) -> StorageResult<()> {
        let end = offset.saturating_add(size_bytes);
        if end > self.cursors.read {
            self.cursors.read = end.min(self.cursors.write);
            self.persist()?;
        }
        Ok(())
    }
}

/// Decorator that reserves the underlying store in larger chunks so
/// sequential small allocations do not each rewrite the state file.
pub struct BulkAllocatingStateStore<S> {
    inner: S,
    chunk_size_bytes: u64,
    reserved_start: u64,
    reserved_end: u64,
}

impl<S: StateStore> BulkAllocatingStateStore<S> {
    pub fn new(inner: S, chunk_size_bytes: u64) -> Self {
        Self {
            inner,
            chunk_size_bytes: chunk_size_bytes.max(1),
            reserved_start: 0,
            reserved_end: 0,
        }
    }
}

impl<S: StateStore> StateStore for BulkAllocatingStateStore<S> {
    fn get_cursors(&self) -> Cursors {
        self.inner.get_cursors()
    }

    fn allocate(&mut self, size_bytes: u64) -> StorageResult<u64> {
        if size_bytes > self.reserved_end - self.reserved_start {
            // Any leftover reservation is abandoned; its bytes simply age
            // out of the window.
            let grab = size_bytes.max(self.chunk_size_bytes);
            self.reserved_start = self.inner.allocate(grab)?;
            self.reserved_end = self.reserved_start + grab;
        }
        let offset = self.reserved_start;
        self.reserved_start += size_bytes;
        Ok(offset)
    }

    fn invalidate(&mut self, offset: u64, size_bytes: u64) -> StorageResult<()> {
        self.inner.invalidate(offset, size_bytes)
    }
}
