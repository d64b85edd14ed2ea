//! Ring data file
//!
//! Blob bytes addressed by absolute cursor positions, wrapped modulo the
//! file capacity. Writes and reads split at the wrap point.

use crate::blobstore::{StorageError, StorageResult};
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

const IO_CHUNK_SIZE: usize = 64 * 1024;

pub trait DataStore: Send + Sync {
    /// Stream exactly `size_bytes` from `reader` into the ring at the
    /// absolute offset.
    fn put(&self, reader: &mut dyn Read, offset: u64, size_bytes: u64) -> StorageResult<()>;

    /// Reader over a region of the ring.
    fn get(&self, offset: u64, size_bytes: u64) -> Box<dyn Read + Send>;
}

pub struct FileDataStore {
    file: Arc<File>,
    capacity: u64,
}

impl FileDataStore {
    pub fn open(path: &Path, capacity: u64) -> StorageResult<Self> {
        if capacity == 0 {
            return Err(StorageError::InvalidArgument(
                "data file capacity must be non-zero".to_string(),
            ));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(capacity)?;
        Ok(Self {
            file: Arc::new(file),
            capacity,
        })
    }

    fn write_wrapped(&self, data: &[u8], offset: u64) -> io::Result<()> {
        let position = offset % self.capacity;
        let contiguous = (self.capacity - position).min(data.len() as u64) as usize;
        self.file.write_all_at(&data[..contiguous], position)?;
        if contiguous < data.len() {
            self.file.write_all_at(&data[contiguous..], 0)?;
        }
        Ok(())
    }
}

impl DataStore for FileDataStore {
    fn put(&self, reader: &mut dyn Read, offset: u64, size_bytes: u64) -> StorageResult<()> {
        let mut chunk = vec![0u8; IO_CHUNK_SIZE];
        let mut written = 0u64;
        loop {
            let n = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => return Err(StorageError::from_io(e)),
            };
            self.write_wrapped(&chunk[..n], offset + written)?;
            written += n as u64;
        }
        if written != size_bytes {
            return Err(StorageError::Internal(format!(
                "wrote {} bytes into the data file, while {} were expected",
                written, size_bytes
            )));
        }
        Ok(())
    }

    fn get(&self, offset: u64, size_bytes: u64) -> Box<dyn Read + Send> {
        Box::new(RingReader {
            file: Arc::clone(&self.file),
            capacity: self.capacity,
            cursor: offset,
            remaining: size_bytes,
        })
    }
}

struct RingReader {
    file: Arc<File>,
    capacity: u64,
    cursor: u64,
    remaining: u64,
}

impl Read for RingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let position = self.cursor % self.capacity;
        let contiguous = (self.capacity - position)
            .min(self.remaining)
            .min(buf.len() as u64) as usize;
        let n = self.file.read_at(&mut buf[..contiguous], position)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "data file ended before the blob did",
            ));
        }
        self.cursor += n as u64;
        self.remaining -= n as u64;
        Ok(n)
    }
}
