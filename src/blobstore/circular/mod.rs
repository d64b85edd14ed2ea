//! Circular storage backend
//!
//! A log-structured ring of bytes with an offset table and cursor-based
//! liveness. The three storage files are injected through separate
//! interfaces: the offset store maps digests to regions, the data store
//! holds the bytes, the state store owns the cursors.

mod data_store;
mod offset_store;
mod state_store;

pub use self::data_store::{DataStore, FileDataStore};
pub use self::offset_store::{CachingOffsetStore, FileOffsetStore, OffsetRecord, OffsetStore};
pub use self::state_store::{BulkAllocatingStateStore, Cursors, FileStateStore, StateStore};

use crate::blobstore::{key_fingerprint128, BlobAccess, StorageError, StorageResult, StorageType};
use crate::buffer::{Buffer, RepairFn};
use crate::context::Context;
use crate::digest::Digest;
use std::sync::{Arc, Mutex};

/// Seed for the persistent record keys. Must stay stable across restarts
/// so existing offset files keep resolving.
const OFFSET_KEY_SEED: u64 = 0x626c6f_62636163;

struct CircularState {
    offset_store: Box<dyn OffsetStore>,
    state_store: Box<dyn StateStore>,
}

/// Circular storage backend.
pub struct CircularBlobAccess {
    data_store: Arc<dyn DataStore>,
    storage_type: StorageType,
    instances: Vec<String>,
    state: Arc<Mutex<CircularState>>,
}

impl CircularBlobAccess {
    pub fn new(
        offset_store: Box<dyn OffsetStore>,
        data_store: Arc<dyn DataStore>,
        state_store: Box<dyn StateStore>,
        storage_type: StorageType,
        instances: Vec<String>,
    ) -> Self {
        Self {
            data_store,
            storage_type,
            instances,
            state: Arc::new(Mutex::new(CircularState {
                offset_store,
                state_store,
            })),
        }
    }

    fn check_instance(&self, digest: &Digest) -> StorageResult<()> {
        if self.storage_type == StorageType::ActionCache
            && !self.instances.iter().any(|i| i == digest.instance())
        {
            return Err(StorageError::InvalidArgument(format!(
                "unknown instance name: {:?}",
                digest.instance()
            )));
        }
        Ok(())
    }

    fn key(&self, digest: &Digest) -> u128 {
        key_fingerprint128(&self.storage_type.digest_key(digest), OFFSET_KEY_SEED)
    }
}

impl BlobAccess for CircularBlobAccess {
    fn get(&self, ctx: &Context, digest: &Digest) -> StorageResult<Buffer> {
        ctx.check()?;
        self.check_instance(digest)?;
        let key = self.key(digest);

        let record = {
            let mut state = self.state.lock().unwrap();
            let cursors = state.state_store.get_cursors();
            state.offset_store.get(key, cursors)?
        };
        let record = match record {
            Some(record) => record,
            None => return Err(StorageError::NotFound),
        };

        let reader = self.data_store.get(record.offset, record.size_bytes);
        let state_for_repair = Arc::clone(&self.state);
        let repair: RepairFn = Box::new(move || {
            let mut state = state_for_repair.lock().unwrap();
            state.state_store.invalidate(record.offset, record.size_bytes)
        });
        Ok(self.storage_type.new_buffer_from_reader(
            digest,
            record.size_bytes,
            reader,
            Some(repair),
        ))
    }

    fn put(&self, ctx: &Context, digest: &Digest, buffer: Buffer) -> StorageResult<()> {
        if let Err(e) = ctx.check() {
            buffer.discard();
            return Err(e);
        }
        if let Err(e) = self.check_instance(digest) {
            buffer.discard();
            return Err(e);
        }
        if self.storage_type.enforces_size() && buffer.size_bytes() != digest.size_bytes() {
            let declared = buffer.size_bytes();
            buffer.discard();
            return Err(StorageError::InvalidArgument(format!(
                "buffer is {} bytes, while the digest claims {} bytes",
                declared,
                digest.size_bytes()
            )));
        }
        let size_bytes = buffer.size_bytes();
        let key = self.key(digest);

        let offset = {
            let mut state = self.state.lock().unwrap();
            match state.state_store.allocate(size_bytes) {
                Ok(offset) => offset,
                Err(e) => {
                    drop(state);
                    buffer.discard();
                    return Err(e);
                }
            }
        };

        // Stream outside the lock; content verification rides the reader.
        let mut reader = buffer.into_reader();
        self.data_store.put(&mut reader, offset, size_bytes)?;

        let mut state = self.state.lock().unwrap();
        let cursors = state.state_store.get_cursors();
        if !cursors.contains(offset, size_bytes) {
            // Concurrent writes pushed the window past our region before
            // the bytes were all down. The caller retries.
            return Err(StorageError::Unavailable(
                "data became stale before write completed".to_string(),
            ));
        }
        state
            .offset_store
            .put(key, OffsetRecord { offset, size_bytes }, cursors)
    }

    fn find_missing(&self, ctx: &Context, digests: &[Digest]) -> StorageResult<Vec<Digest>> {
        ctx.check()?;
        let mut state = self.state.lock().unwrap();
        let cursors = state.state_store.get_cursors();
        let mut missing = Vec::new();
        for digest in digests {
            self.check_instance(digest)?;
            if state.offset_store.get(self.key(digest), cursors)?.is_none() {
                missing.push(digest.clone());
            }
        }
        Ok(missing)
    }
}
