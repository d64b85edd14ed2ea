//! Local on-host storage backend
//!
//! A digest-location map over a ring of fixed-size blocks. One mutex
//! guards the map, the block list and the allocator; block content reads
//! run lock-free against the shared file handle and rely on content
//! verification to catch rotation that happened mid-read.

mod block_list;
mod location_map;

pub use self::block_list::Partition;

use self::block_list::BlockList;
use self::location_map::{DigestLocationMap, Location};
use crate::blobstore::{key_fingerprint64, BlobAccess, StorageError, StorageResult, StorageType};
use crate::buffer::{Buffer, RepairFn};
use crate::context::Context;
use crate::digest::Digest;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

const WRITE_CHUNK_SIZE: usize = 64 * 1024;

/// Geometry and sizing of a local backend.
pub struct LocalBlobAccessOptions<'a> {
    pub path: &'a Path,
    pub block_size_bytes: u64,
    pub old_blocks: usize,
    pub current_blocks: usize,
    pub new_blocks: usize,
    pub digest_location_map_size: usize,
    pub digest_location_map_maximum_get_attempts: u32,
    pub digest_location_map_maximum_put_attempts: u32,
    pub instances: Vec<String>,
}

struct LocalState {
    map: DigestLocationMap,
    blocks: BlockList,
}

/// Local storage backend.
pub struct LocalBlobAccess {
    file: Arc<File>,
    storage_type: StorageType,
    instances: Vec<String>,
    seed: u64,
    state: Arc<Mutex<LocalState>>,
}

impl LocalBlobAccess {
    pub fn new(
        options: LocalBlobAccessOptions<'_>,
        storage_type: StorageType,
    ) -> StorageResult<Self> {
        let blocks = BlockList::new(
            options.path,
            options.block_size_bytes,
            options.old_blocks,
            options.current_blocks,
            options.new_blocks,
        )?;
        // The map is in-memory, so a per-process seed is fine and keeps
        // candidate derivation independent from any outer sharding layer.
        let seed = rand::random::<u64>();
        let map = DigestLocationMap::new(
            options.digest_location_map_size,
            seed,
            options.digest_location_map_maximum_get_attempts,
            options.digest_location_map_maximum_put_attempts,
        );
        Ok(Self {
            file: blocks.file_handle(),
            storage_type,
            instances: options.instances,
            seed,
            state: Arc::new(Mutex::new(LocalState { map, blocks })),
        })
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

    fn fingerprint(&self, digest: &Digest) -> u64 {
        key_fingerprint64(&self.storage_type.digest_key(digest), self.seed)
    }

    /// Copy a blob out of an old block into a fresh location. The source
    /// bytes are read first: rotation during allocation may recycle the
    /// very block being refreshed, and the copy regions could overlap.
    fn refresh(&self, state: &mut LocalState, fingerprint: u64, location: Location) -> StorageResult<Location> {
        let data = state
            .blocks
            .read(location.block_index, location.offset_bytes, location.size_bytes)?;
        let (block_index, offset_bytes, epoch) = state.blocks.allocate(location.size_bytes)?;
        state.blocks.write(block_index, offset_bytes, &data)?;
        let refreshed = Location {
            block_index,
            offset_bytes,
            size_bytes: location.size_bytes,
            epoch,
        };
        let min_epoch = state.blocks.min_live_epoch();
        state.map.put(fingerprint, refreshed, min_epoch);
        Ok(refreshed)
    }

    #[cfg(test)]
    fn partition_of(&self, digest: &Digest) -> Option<Partition> {
        let fingerprint = self.fingerprint(digest);
        let state = self.state.lock().unwrap();
        let min_epoch = state.blocks.min_live_epoch();
        state
            .map
            .get(fingerprint, min_epoch)
            .map(|location| state.blocks.partition_of(location.block_index))
    }
}

impl BlobAccess for LocalBlobAccess {
    fn get(&self, ctx: &Context, digest: &Digest) -> StorageResult<Buffer> {
        ctx.check()?;
        self.check_instance(digest)?;
        let fingerprint = self.fingerprint(digest);

        let mut state = self.state.lock().unwrap();
        let min_epoch = state.blocks.min_live_epoch();
        let mut location = match state.map.get(fingerprint, min_epoch) {
            Some(location) => location,
            None => return Err(StorageError::NotFound),
        };
        if state.blocks.partition_of(location.block_index) == Partition::Old {
            // Refreshing only from old blocks bounds redundancy and
            // avoids thrashing the warm band.
            match self.refresh(&mut state, fingerprint, location) {
                Ok(refreshed) => location = refreshed,
                Err(e) => log::warn!("failed to refresh blob {}: {}", digest, e),
            }
        }
        let base = state.blocks.byte_offset(location.block_index, location.offset_bytes);
        drop(state);

        let reader = BlockReader {
            file: Arc::clone(&self.file),
            position: base,
            remaining: location.size_bytes,
        };
        let state_for_repair = Arc::clone(&self.state);
        let repair: RepairFn = Box::new(move || {
            let mut state = state_for_repair.lock().unwrap();
            state.map.invalidate(fingerprint, location);
            Ok(())
        });
        Ok(self.storage_type.new_buffer_from_reader(
            digest,
            location.size_bytes,
            Box::new(reader),
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
        let fingerprint = self.fingerprint(digest);

        let (block_index, offset_bytes, epoch, base) = {
            let mut state = self.state.lock().unwrap();
            let allocation = state.blocks.allocate(size_bytes);
            let (block_index, offset_bytes, epoch) = match allocation {
                Ok(a) => a,
                Err(e) => {
                    drop(state);
                    buffer.discard();
                    return Err(e);
                }
            };
            let base = state.blocks.byte_offset(block_index, offset_bytes);
            (block_index, offset_bytes, epoch, base)
        };

        // Stream outside the lock; content verification rides the reader.
        // A failure simply abandons the reserved bytes in place.
        let mut reader = buffer.into_reader();
        let mut chunk = vec![0u8; WRITE_CHUNK_SIZE];
        let mut position = base;
        loop {
            ctx.check()?;
            let n = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => return Err(StorageError::from_io(e)),
            };
            self.file.write_all_at(&chunk[..n], position)?;
            position += n as u64;
        }

        let mut state = self.state.lock().unwrap();
        if state.blocks.epoch_of(block_index) != epoch {
            return Err(StorageError::Internal(
                "block was recycled while the blob was being written".to_string(),
            ));
        }
        let min_epoch = state.blocks.min_live_epoch();
        state.map.put(
            fingerprint,
            Location {
                block_index,
                offset_bytes,
                size_bytes,
                epoch,
            },
            min_epoch,
        );
        Ok(())
    }

    fn find_missing(&self, ctx: &Context, digests: &[Digest]) -> StorageResult<Vec<Digest>> {
        ctx.check()?;
        let state = self.state.lock().unwrap();
        let min_epoch = state.blocks.min_live_epoch();
        let mut missing = Vec::new();
        for digest in digests {
            self.check_instance(digest)?;
            if state.map.get(self.fingerprint(digest), min_epoch).is_none() {
                missing.push(digest.clone());
            }
        }
        Ok(missing)
    }
}

/// Lock-free reader over a block region.
struct BlockReader {
    file: Arc<File>,
    position: u64,
    remaining: u64,
}

impl Read for BlockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let want = (self.remaining as usize).min(buf.len());
        let n = self.file.read_at(&mut buf[..want], self.position)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "block file ended before the blob did",
            ));
        }
        self.position += n as u64;
        self.remaining -= n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sha256(data: &[u8]) -> Digest {
        Digest::new("", &"0".repeat(64), 0).unwrap().derive(data)
    }

    fn cas_backend(
        temp: &TempDir,
        block_size: u64,
        old: usize,
        current: usize,
        new: usize,
    ) -> LocalBlobAccess {
        LocalBlobAccess::new(
            LocalBlobAccessOptions {
                path: &temp.path().join("blocks"),
                block_size_bytes: block_size,
                old_blocks: old,
                current_blocks: current,
                new_blocks: new,
                digest_location_map_size: 1024,
                digest_location_map_maximum_get_attempts: 8,
                digest_location_map_maximum_put_attempts: 32,
                instances: Vec::new(),
            },
            StorageType::ContentAddressable,
        )
        .unwrap()
    }

    fn put_bytes(backend: &LocalBlobAccess, data: &[u8]) -> Digest {
        let digest = sha256(data);
        backend
            .put(
                &Context::background(),
                &digest,
                Buffer::cas_from_bytes(&digest, data.to_vec(), None),
            )
            .unwrap();
        digest
    }

    #[test]
    fn test_put_get_roundtrip() {
        let temp = TempDir::new().unwrap();
        let backend = cas_backend(&temp, 1 << 20, 2, 2, 1);
        let digest = put_bytes(&backend, b"hello local backend");
        let data = backend
            .get(&Context::background(), &digest)
            .unwrap()
            .into_byte_slice(1 << 20)
            .unwrap();
        assert_eq!(data, b"hello local backend");
    }

    #[test]
    fn test_empty_blob() {
        let temp = TempDir::new().unwrap();
        let backend = cas_backend(&temp, 1 << 20, 1, 1, 1);
        let digest = put_bytes(&backend, b"");
        assert_eq!(digest.size_bytes(), 0);
        let data = backend
            .get(&Context::background(), &digest)
            .unwrap()
            .into_byte_slice(1 << 20)
            .unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn test_get_absent_is_not_found() {
        let temp = TempDir::new().unwrap();
        let backend = cas_backend(&temp, 1 << 20, 1, 1, 1);
        assert!(matches!(
            backend.get(&Context::background(), &sha256(b"never stored")),
            Err(StorageError::NotFound)
        ));
    }

    #[test]
    fn test_repeated_put_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let backend = cas_backend(&temp, 1 << 20, 1, 1, 1);
        let digest = put_bytes(&backend, b"same blob");
        put_bytes(&backend, b"same blob");
        let data = backend
            .get(&Context::background(), &digest)
            .unwrap()
            .into_byte_slice(1 << 20)
            .unwrap();
        assert_eq!(data, b"same blob");
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let temp = TempDir::new().unwrap();
        let backend = cas_backend(&temp, 1 << 20, 1, 1, 1);
        let digest = Digest::new("", &"a".repeat(64), 10).unwrap();
        let result = backend.put(
            &Context::background(),
            &digest,
            Buffer::from_validated_bytes(b"short".to_vec()),
        );
        assert!(matches!(result, Err(StorageError::InvalidArgument(_))));
    }

    #[test]
    fn test_corrupted_upload_rejected() {
        let temp = TempDir::new().unwrap();
        let backend = cas_backend(&temp, 1 << 20, 1, 1, 1);
        let digest = sha256(b"genuine");
        let result = backend.put(
            &Context::background(),
            &digest,
            Buffer::cas_from_bytes(&digest, b"forgery".to_vec(), None),
        );
        assert!(matches!(result, Err(StorageError::DataCorrupted(_))));
        assert!(matches!(
            backend.get(&Context::background(), &digest),
            Err(StorageError::NotFound)
        ));
    }

    #[test]
    fn test_blob_larger_than_block_is_resource_exhausted() {
        let temp = TempDir::new().unwrap();
        let backend = cas_backend(&temp, 1024, 1, 1, 1);
        let data = vec![7u8; 2048];
        let digest = sha256(&data);
        let result = backend.put(
            &Context::background(),
            &digest,
            Buffer::cas_from_bytes(&digest, data, None),
        );
        assert!(matches!(result, Err(StorageError::ResourceExhausted(_))));
    }

    #[test]
    fn test_eviction_under_write_pressure() {
        let temp = TempDir::new().unwrap();
        // Three 1 KiB blocks; 4 KiB of unique 100-byte blobs overflows the
        // ring several times.
        let backend = cas_backend(&temp, 1024, 1, 1, 1);
        let mut digests = Vec::new();
        for i in 0..40u32 {
            let data = vec![i as u8; 100];
            digests.push(put_bytes(&backend, &data));
        }
        assert!(matches!(
            backend.get(&Context::background(), &digests[0]),
            Err(StorageError::NotFound)
        ));
        let last = digests.last().unwrap();
        let data = backend
            .get(&Context::background(), last)
            .unwrap()
            .into_byte_slice(1024)
            .unwrap();
        assert_eq!(data, vec![39u8; 100]);
    }

    #[test]
    fn test_refresh_on_read_from_old_block() {
        let temp = TempDir::new().unwrap();
        let backend = cas_backend(&temp, 1024, 1, 1, 1);
        let digest = put_bytes(&backend, b"refresh me");
        // Two rotations push the blob's block into the old partition.
        put_bytes(&backend, &vec![1u8; 1000]);
        put_bytes(&backend, &vec![2u8; 1000]);
        assert_eq!(backend.partition_of(&digest), Some(Partition::Old));

        let data = backend
            .get(&Context::background(), &digest)
            .unwrap()
            .into_byte_slice(1024)
            .unwrap();
        assert_eq!(data, b"refresh me");
        assert_eq!(backend.partition_of(&digest), Some(Partition::New));
    }

    #[test]
    fn test_find_missing() {
        let temp = TempDir::new().unwrap();
        let backend = cas_backend(&temp, 1 << 20, 1, 1, 1);
        let present = put_bytes(&backend, b"present");
        let absent = sha256(b"absent");
        let missing = backend
            .find_missing(&Context::background(), &[present.clone(), absent.clone()])
            .unwrap();
        assert_eq!(missing, vec![absent]);
    }

    #[test]
    fn test_corruption_fires_repair_and_entry_dies() {
        let temp = TempDir::new().unwrap();
        let backend = cas_backend(&temp, 1 << 20, 1, 1, 1);
        let digest = put_bytes(&backend, b"will be mangled");

        // Mangle the stored bytes out-of-band.
        {
            let state = backend.state.lock().unwrap();
            let fingerprint = backend.fingerprint(&digest);
            let min_epoch = state.blocks.min_live_epoch();
            let location = state.map.get(fingerprint, min_epoch).unwrap();
            let base = state
                .blocks
                .byte_offset(location.block_index, location.offset_bytes);
            backend.file.write_all_at(b"XXXX", base).unwrap();
        }

        let result = backend
            .get(&Context::background(), &digest)
            .unwrap()
            .into_byte_slice(1 << 20);
        assert!(matches!(result, Err(StorageError::DataCorrupted(_))));
        // The repair callback invalidated the map entry.
        assert!(matches!(
            backend.get(&Context::background(), &digest),
            Err(StorageError::NotFound)
        ));
    }

    #[test]
    fn test_action_cache_instance_partitioning() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBlobAccess::new(
            LocalBlobAccessOptions {
                path: &temp.path().join("blocks"),
                block_size_bytes: 1 << 20,
                old_blocks: 1,
                current_blocks: 1,
                new_blocks: 1,
                digest_location_map_size: 1024,
                digest_location_map_maximum_get_attempts: 8,
                digest_location_map_maximum_put_attempts: 32,
                instances: vec!["left".to_string(), "right".to_string()],
            },
            StorageType::ActionCache,
        )
        .unwrap();
        let ctx = Context::background();

        let left = Digest::new("left", &"a".repeat(64), 9).unwrap();
        let right = Digest::new("right", &"a".repeat(64), 9).unwrap();
        backend
            .put(&ctx, &left, Buffer::from_validated_bytes(b"left payload".to_vec()))
            .unwrap();

        assert_eq!(
            backend.get(&ctx, &left).unwrap().into_byte_slice(1024).unwrap(),
            b"left payload"
        );
        assert!(matches!(backend.get(&ctx, &right), Err(StorageError::NotFound)));

        let unknown = Digest::new("elsewhere", &"a".repeat(64), 9).unwrap();
        assert!(matches!(
            backend.get(&ctx, &unknown),
            Err(StorageError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_cancelled_context() {
        let temp = TempDir::new().unwrap();
        let backend = cas_backend(&temp, 1 << 20, 1, 1, 1);
        let ctx = Context::background();
        ctx.cancel();
        assert!(matches!(
            backend.get(&ctx, &sha256(b"x")),
            Err(StorageError::DeadlineExceeded)
        ));
        let digest = sha256(b"y");
        assert!(matches!(
            backend.put(&ctx, &digest, Buffer::cas_from_bytes(&digest, b"y".to_vec(), None)),
            Err(StorageError::DeadlineExceeded)
        ));
    }
}
