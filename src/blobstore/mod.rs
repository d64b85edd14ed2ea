//! Storage backends
//!
//! This module defines the BlobAccess contract every backend implements,
//! the wire-independent error kinds, and the CAS/AC storage-type dispatch
//! that decides how buffers are constructed and how digests are keyed.

pub mod circular;
pub mod error;
pub mod factory;
pub mod local;
pub mod mirrored;
pub mod read_caching;
pub mod remote;
pub mod sharding;
pub mod size_distinguishing;

use crate::buffer::{Buffer, RepairFn};
use crate::context::Context;
use crate::digest::Digest;
use std::io::{self, Read};
use thiserror::Error;
use xxhash_rust::xxh3::{xxh3_128_with_seed, xxh3_64_with_seed};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("blob not found")]
    NotFound,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("data corruption detected: {0}")]
    DataCorrupted(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Wrap this error in an `io::Error` so it can travel through `Read`
    /// implementations without losing its kind.
    pub(crate) fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, self)
    }

    /// Recover a `StorageError` smuggled through `into_io`; anything else
    /// stays an I/O error.
    pub(crate) fn from_io(e: io::Error) -> StorageError {
        if e.get_ref().map_or(false, |r| r.is::<StorageError>()) {
            if let Some(inner) = e.into_inner() {
                if let Ok(storage) = inner.downcast::<StorageError>() {
                    return *storage;
                }
            }
            return StorageError::Internal("error context lost in I/O conversion".to_string());
        }
        StorageError::Io(e)
    }
}

/// Blob access trait - the uniform contract for every storage backend.
pub trait BlobAccess: Send + Sync {
    /// Fetch a blob. The returned buffer yields the stored bytes and, for
    /// content-addressed backends, verifies them against the digest.
    fn get(&self, ctx: &Context, digest: &Digest) -> StorageResult<Buffer>;

    /// Store a blob. The buffer is consumed on every path.
    fn put(&self, ctx: &Context, digest: &Digest, buffer: Buffer) -> StorageResult<()>;

    /// Return the subset of `digests` this backend does not hold.
    fn find_missing(&self, ctx: &Context, digests: &[Digest]) -> StorageResult<Vec<Digest>>;
}

/// Distinguishes content-addressed storage from the action cache. CAS
/// blobs are self-verifying and instance-blind; AC payloads are opaque
/// records partitioned per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    ContentAddressable,
    ActionCache,
}

impl StorageType {
    /// Key under which a digest is stored. CAS unifies instances; AC
    /// partitions by them.
    pub fn digest_key(&self, digest: &Digest) -> String {
        match self {
            StorageType::ContentAddressable => {
                format!("{}-{}", digest.hash(), digest.size_bytes())
            }
            StorageType::ActionCache => format!(
                "{}-{}-{}",
                digest.hash(),
                digest.size_bytes(),
                digest.instance()
            ),
        }
    }

    /// Buffer over a stored byte stream. CAS buffers verify and may carry
    /// a repair callback; AC buffers are irreparable and sized by the
    /// stored payload length.
    pub fn new_buffer_from_reader(
        &self,
        digest: &Digest,
        stored_size_bytes: u64,
        reader: Box<dyn Read + Send>,
        repair: Option<RepairFn>,
    ) -> Buffer {
        match self {
            StorageType::ContentAddressable => Buffer::cas_from_reader(digest, reader, repair),
            StorageType::ActionCache => Buffer::opaque_from_reader(stored_size_bytes, reader),
        }
    }

    /// Buffer over in-memory bytes, verified lazily for CAS.
    pub fn new_buffer_from_bytes(&self, digest: &Digest, data: Vec<u8>) -> Buffer {
        match self {
            StorageType::ContentAddressable => Buffer::cas_from_bytes(digest, data, None),
            StorageType::ActionCache => Buffer::from_validated_bytes(data),
        }
    }

    /// True when put must reject buffers whose size differs from the
    /// digest. AC payload lengths are independent of the digest size.
    pub fn enforces_size(&self) -> bool {
        matches!(self, StorageType::ContentAddressable)
    }
}

/// 64-bit fingerprint of a digest key.
pub(crate) fn key_fingerprint64(key: &str, seed: u64) -> u64 {
    xxh3_64_with_seed(key.as_bytes(), seed)
}

/// 128-bit fingerprint of a digest key, for persistent record files.
pub(crate) fn key_fingerprint128(key: &str, seed: u64) -> u128 {
    xxh3_128_with_seed(key.as_bytes(), seed)
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory backend shared by decorator tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub(crate) struct InMemoryBlobAccess {
        storage_type: StorageType,
        blobs: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl InMemoryBlobAccess {
        pub(crate) fn new(storage_type: StorageType) -> Self {
            Self {
                storage_type,
                blobs: Mutex::new(HashMap::new()),
            }
        }

        pub(crate) fn remove(&self, digest: &Digest) {
            self.blobs
                .lock()
                .unwrap()
                .remove(&self.storage_type.digest_key(digest));
        }

        pub(crate) fn corrupt(&self, digest: &Digest) {
            let mut blobs = self.blobs.lock().unwrap();
            if let Some(data) = blobs.get_mut(&self.storage_type.digest_key(digest)) {
                data.push(0xFF);
            }
        }

        pub(crate) fn contains(&self, digest: &Digest) -> bool {
            self.blobs
                .lock()
                .unwrap()
                .contains_key(&self.storage_type.digest_key(digest))
        }
    }

    impl BlobAccess for InMemoryBlobAccess {
        fn get(&self, ctx: &Context, digest: &Digest) -> StorageResult<Buffer> {
            ctx.check()?;
            let blobs = self.blobs.lock().unwrap();
            match blobs.get(&self.storage_type.digest_key(digest)) {
                Some(data) => Ok(self.storage_type.new_buffer_from_bytes(digest, data.clone())),
                None => Err(StorageError::NotFound),
            }
        }

        fn put(&self, ctx: &Context, digest: &Digest, buffer: Buffer) -> StorageResult<()> {
            if let Err(e) = ctx.check() {
                buffer.discard();
                return Err(e);
            }
            let data = buffer.into_byte_slice(usize::MAX)?;
            self.blobs
                .lock()
                .unwrap()
                .insert(self.storage_type.digest_key(digest), data);
            Ok(())
        }

        fn find_missing(&self, ctx: &Context, digests: &[Digest]) -> StorageResult<Vec<Digest>> {
            ctx.check()?;
            let blobs = self.blobs.lock().unwrap();
            Ok(digests
                .iter()
                .filter(|d| !blobs.contains_key(&self.storage_type.digest_key(d)))
                .cloned()
                .collect())
        }
    }
}
