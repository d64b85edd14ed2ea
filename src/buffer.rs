//! Lazy byte containers
//!
//! A `Buffer` is the unit of data exchange between backends: it knows its
//! size up front, yields its bytes through exactly one terminal operation,
//! and for content-addressed blobs verifies hash and length at end of
//! stream. A verification failure fires the buffer's repair callback (if
//! one was wired in) exactly once before surfacing `DataCorrupted`.

use crate::blobstore::{StorageError, StorageResult};
use crate::digest::{Digest, DigestHasher};
use std::io::{self, Cursor, Read, Write};

const IO_CHUNK_SIZE: usize = 64 * 1024;

/// One-shot upcall invoked when a stored blob fails verification. The
/// creator of the buffer uses it to invalidate its index entry.
pub type RepairFn = Box<dyn FnOnce() -> StorageResult<()> + Send>;

/// Pull-based chunked reader. `Ok(None)` marks end of stream.
pub trait ChunkReader: Send {
    fn read_chunk(&mut self) -> StorageResult<Option<Vec<u8>>>;
}

enum Source {
    Bytes(Vec<u8>),
    Reader(Box<dyn Read + Send>),
}

struct Validation {
    digest: Digest,
    repair: Option<RepairFn>,
}

struct Inner {
    size_bytes: u64,
    source: Source,
    validation: Option<Validation>,
}

/// A byte container consumed by exactly one terminal operation.
pub struct Buffer {
    inner: Option<Inner>,
}

impl Buffer {
    /// Buffer over bytes that need no further verification.
    pub fn from_validated_bytes(data: Vec<u8>) -> Self {
        Self {
            inner: Some(Inner {
                size_bytes: data.len() as u64,
                source: Source::Bytes(data),
                validation: None,
            }),
        }
    }

    /// Content-addressed buffer over in-memory bytes; hash and length are
    /// checked against `digest` when the buffer is consumed.
    pub fn cas_from_bytes(digest: &Digest, data: Vec<u8>, repair: Option<RepairFn>) -> Self {
        Self {
            inner: Some(Inner {
                size_bytes: digest.size_bytes(),
                source: Source::Bytes(data),
                validation: Some(Validation {
                    digest: digest.clone(),
                    repair,
                }),
            }),
        }
    }

    /// Content-addressed buffer over a byte stream.
    pub fn cas_from_reader(
        digest: &Digest,
        reader: Box<dyn Read + Send>,
        repair: Option<RepairFn>,
    ) -> Self {
        Self {
            inner: Some(Inner {
                size_bytes: digest.size_bytes(),
                source: Source::Reader(reader),
                validation: Some(Validation {
                    digest: digest.clone(),
                    repair,
                }),
            }),
        }
    }

    /// Opaque (action cache) buffer over a byte stream of known length.
    /// Never verified, never reparable.
    pub fn opaque_from_reader(size_bytes: u64, reader: Box<dyn Read + Send>) -> Self {
        Self {
            inner: Some(Inner {
                size_bytes,
                source: Source::Reader(reader),
                validation: None,
            }),
        }
    }

    /// Declared size of the contents.
    pub fn size_bytes(&self) -> u64 {
        match &self.inner {
            Some(inner) => inner.size_bytes,
            None => 0,
        }
    }

    /// Drop the buffer without reading it. The repair callback is
    /// discarded unfired.
    pub fn discard(mut self) {
        self.inner.take();
    }

    /// Read the whole buffer into memory, verifying it. Fails with
    /// `InvalidArgument` if the declared size exceeds `max_size_bytes`.
    pub fn into_byte_slice(mut self, max_size_bytes: usize) -> StorageResult<Vec<u8>> {
        let inner = match self.inner.take() {
            Some(inner) => inner,
            None => return Ok(Vec::new()),
        };
        if inner.size_bytes > max_size_bytes as u64 {
            return Err(StorageError::InvalidArgument(format!(
                "blob is {} bytes, while a maximum of {} bytes is permitted",
                inner.size_bytes, max_size_bytes
            )));
        }
        let mut reader = VerifyingReader::new(inner);
        // The declared size is not trusted for the initial allocation.
        let mut data = Vec::with_capacity((reader.expected_size as usize).min(IO_CHUNK_SIZE));
        reader
            .read_to_end(&mut data)
            .map_err(StorageError::from_io)?;
        Ok(data)
    }

    /// Turn the buffer into a verifying `Read`. Verification failures
    /// surface as `InvalidData` I/O errors wrapping a `StorageError`.
    pub fn into_reader(mut self) -> Box<dyn Read + Send> {
        match self.inner.take() {
            Some(inner) => Box::new(VerifyingReader::new(inner)),
            None => Box::new(Cursor::new(Vec::new())),
        }
    }

    /// Turn the buffer into a pull-based chunk reader starting at
    /// `offset`, yielding chunks of at most `chunk_size` bytes.
    pub fn into_chunk_reader(mut self, offset: u64, chunk_size: usize) -> Box<dyn ChunkReader> {
        let inner = match self.inner.take() {
            Some(inner) => inner,
            None => {
                return Box::new(BufferChunkReader {
                    reader: None,
                    to_skip: 0,
                    chunk_size,
                    pending_error: None,
                })
            }
        };
        let pending_error = if offset > inner.size_bytes {
            Some(StorageError::InvalidArgument(format!(
                "read offset {} is beyond the blob size of {} bytes",
                offset, inner.size_bytes
            )))
        } else {
            None
        };
        Box::new(BufferChunkReader {
            reader: Some(VerifyingReader::new(inner)),
            to_skip: offset,
            chunk_size: chunk_size.max(1),
            pending_error,
        })
    }

    /// Stream the buffer into a sink, verifying it along the way.
    pub fn into_writer(mut self, sink: &mut dyn Write) -> StorageResult<()> {
        let inner = match self.inner.take() {
            Some(inner) => inner,
            None => return Ok(()),
        };
        let mut reader = VerifyingReader::new(inner);
        let mut chunk = vec![0u8; IO_CHUNK_SIZE];
        loop {
            let n = reader.read(&mut chunk).map_err(StorageError::from_io)?;
            if n == 0 {
                return Ok(());
            }
            sink.write_all(&chunk[..n])?;
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // Leaking a buffer leaks its backing I/O handle.
        debug_assert!(
            self.inner.is_none(),
            "buffer dropped without being consumed or discarded"
        );
    }
}

/// Reader enforcing the declared size and, for content-addressed buffers,
/// the digest hash at end of stream.
struct VerifyingReader {
    source: Box<dyn Read + Send>,
    expected_size: u64,
    bytes_read: u64,
    content_addressed: bool,
    hasher: Option<DigestHasher>,
    digest: Option<Digest>,
    repair: Option<RepairFn>,
    finished: bool,
}

impl VerifyingReader {
    fn new(inner: Inner) -> Self {
        let content_addressed = inner.validation.is_some();
        let (hasher, digest, repair) = match inner.validation {
            Some(v) => (Some(v.digest.hasher()), Some(v.digest), v.repair),
            None => (None, None, None),
        };
        let source: Box<dyn Read + Send> = match inner.source {
            Source::Bytes(data) => Box::new(Cursor::new(data)),
            Source::Reader(r) => r,
        };
        Self {
            source,
            expected_size: inner.size_bytes,
            bytes_read: 0,
            content_addressed,
            hasher,
            digest,
            repair,
            finished: false,
        }
    }

    fn corrupt(&mut self, message: String) -> io::Error {
        self.finished = true;
        if let Some(repair) = self.repair.take() {
            if let Err(e) = repair() {
                log::warn!("repair of corrupted blob failed: {}", e);
            }
        }
        let kind = if self.content_addressed {
            StorageError::DataCorrupted(message)
        } else {
            StorageError::Internal(message)
        };
        kind.into_io()
    }

    fn finish(&mut self) -> io::Result<()> {
        self.finished = true;
        if self.bytes_read != self.expected_size {
            return Err(self.corrupt(format!(
                "blob is {} bytes, while {} bytes were expected",
                self.bytes_read, self.expected_size
            )));
        }
        if let (Some(hasher), Some(digest)) = (self.hasher.take(), self.digest.take()) {
            let actual = hasher.finish_hex();
            if actual != digest.hash() {
                return Err(self.corrupt(format!(
                    "blob hashes to {}, while {} was expected",
                    actual,
                    digest.hash()
                )));
            }
        }
        Ok(())
    }
}

impl Read for VerifyingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.finished {
            return Ok(0);
        }
        let n = self.source.read(buf)?;
        if n == 0 {
            self.finish()?;
            return Ok(0);
        }
        self.bytes_read += n as u64;
        if self.bytes_read > self.expected_size {
            return Err(self.corrupt(format!(
                "blob is longer than the expected {} bytes",
                self.expected_size
            )));
        }
        if let Some(hasher) = &mut self.hasher {
            hasher.update(&buf[..n]);
        }
        Ok(n)
    }
}

struct BufferChunkReader {
    reader: Option<VerifyingReader>,
    to_skip: u64,
    chunk_size: usize,
    pending_error: Option<StorageError>,
}

impl ChunkReader for BufferChunkReader {
    fn read_chunk(&mut self) -> StorageResult<Option<Vec<u8>>> {
        if let Some(e) = self.pending_error.take() {
            self.reader = None;
            return Err(e);
        }
        let reader = match &mut self.reader {
            Some(reader) => reader,
            None => return Ok(None),
        };
        let mut scratch = [0u8; IO_CHUNK_SIZE];
        while self.to_skip > 0 {
            let want = (self.to_skip as usize).min(scratch.len());
            let n = reader
                .read(&mut scratch[..want])
                .map_err(StorageError::from_io)?;
            if n == 0 {
                self.reader = None;
                return Ok(None);
            }
            self.to_skip -= n as u64;
        }
        let mut chunk = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < chunk.len() {
            match reader.read(&mut chunk[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    self.reader = None;
                    return Err(StorageError::from_io(e));
                }
            }
        }
        if filled == 0 {
            self.reader = None;
            return Ok(None);
        }
        chunk.truncate(filled);
        Ok(Some(chunk))
    }
}
