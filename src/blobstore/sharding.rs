//! Sharding decorator
//!
//! Routes each digest to one of a weighted set of shards. A drained
//! shard keeps its weight in the draw, so adding or draining shards
//! reroutes only the affected slice of the keyspace while every other
//! assignment stays put.

use crate::blobstore::{
    key_fingerprint64, BlobAccess, StorageError, StorageResult, StorageType,
};
use crate::buffer::Buffer;
use crate::context::Context;
use crate::digest::Digest;
use std::collections::HashMap;
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Bound on re-draws when drained shards keep getting hit. With at least
/// one undrained shard the expected number of draws is total/undrained.
const MAXIMUM_DRAW_ATTEMPTS: u64 = 256;

pub struct Shard {
    /// Absent for a drained shard. Its weight still participates in the
    /// draw so the undrained shards keep their assignments.
    pub backend: Option<Arc<dyn BlobAccess>>,
    pub weight: u64,
}

pub struct ShardingBlobAccess {
    shards: Vec<Shard>,
    total_weight: u64,
    hash_initialization: u64,
    storage_type: StorageType,
}

impl ShardingBlobAccess {
    pub fn new(
        shards: Vec<Shard>,
        hash_initialization: u64,
        storage_type: StorageType,
    ) -> StorageResult<Self> {
        if shards.iter().any(|s| s.weight == 0) {
            return Err(StorageError::InvalidArgument(
                "shard weights must be positive".to_string(),
            ));
        }
        if !shards.iter().any(|s| s.backend.is_some()) {
            return Err(StorageError::InvalidArgument(
                "at least one shard must have a backend".to_string(),
            ));
        }
        let total_weight = shards.iter().map(|s| s.weight).sum();
        Ok(Self {
            shards,
            total_weight,
            hash_initialization,
            storage_type,
        })
    }

    /// Deterministic shard selection: draw positions in the cumulative
    /// weight windows until one lands on an undrained shard.
    fn shard_index(&self, digest: &Digest) -> StorageResult<usize> {
        let fingerprint = key_fingerprint64(
            &self.storage_type.digest_key(digest),
            self.hash_initialization,
        );
        for attempt in 0..MAXIMUM_DRAW_ATTEMPTS {
            let draw = xxh3_64_with_seed(&fingerprint.to_le_bytes(), attempt) % self.total_weight;
            let mut window_end = 0u64;
            for (index, shard) in self.shards.iter().enumerate() {
                window_end += shard.weight;
                if draw < window_end {
                    if shard.backend.is_some() {
                        return Ok(index);
                    }
                    break;
                }
            }
        }
        Err(StorageError::Internal(
            "shard selection exhausted its draw attempts".to_string(),
        ))
    }

    fn backend_for(&self, digest: &Digest) -> StorageResult<&Arc<dyn BlobAccess>> {
        let index = self.shard_index(digest)?;
        self.shards[index]
            .backend
            .as_ref()
            .ok_or_else(|| StorageError::Internal("selected shard is drained".to_string()))
    }
}

impl BlobAccess for ShardingBlobAccess {
    fn get(&self, ctx: &Context, digest: &Digest) -> StorageResult<Buffer> {
        self.backend_for(digest)?.get(ctx, digest)
    }

    fn put(&self, ctx: &Context, digest: &Digest, buffer: Buffer) -> StorageResult<()> {
        let backend = match self.backend_for(digest) {
            Ok(backend) => backend,
            Err(e) => {
                buffer.discard();
                return Err(e);
            }
        };
        backend.put(ctx, digest, buffer)
    }

    fn find_missing(&self, ctx: &Context, digests: &[Digest]) -> StorageResult<Vec<Digest>> {
        // Partition the request per shard, preserving nothing about order.
        let mut per_shard: HashMap<usize, Vec<Digest>> = HashMap::new();
        for digest in digests {
            per_shard
                .entry(self.shard_index(digest)?)
                .or_default()
                .push(digest.clone());
        }
        let mut missing = Vec::new();
        for (index, digests) in per_shard {
            let backend = self.shards[index]
                .backend
                .as_ref()
                .ok_or_else(|| StorageError::Internal("selected shard is drained".to_string()))?;
            missing.extend(backend.find_missing(ctx, &digests)?);
        }
        Ok(missing)
    }
}
