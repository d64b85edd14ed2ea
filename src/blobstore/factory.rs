//! Backend tree construction
//!
//! Turns a parsed configuration tree into a tree of BlobAccess
//! instances for one storage type.

use crate::blobstore::circular::{
    BulkAllocatingStateStore, CachingOffsetStore, CircularBlobAccess, FileDataStore,
    FileOffsetStore, FileStateStore,
};
use crate::blobstore::error::ErrorBlobAccess;
use crate::blobstore::local::{LocalBlobAccess, LocalBlobAccessOptions};
use crate::blobstore::mirrored::MirroredBlobAccess;
use crate::blobstore::read_caching::ReadCachingBlobAccess;
use crate::blobstore::remote::RemoteBlobAccess;
use crate::blobstore::sharding::{Shard, ShardingBlobAccess};
use crate::blobstore::size_distinguishing::SizeDistinguishingBlobAccess;
use crate::blobstore::{BlobAccess, StorageType};
use crate::config::{BlobAccessConfig, ConfigError};
use std::path::Path;
use std::sync::Arc;

/// Build a backend tree from its configuration.
pub fn new_blob_access(
    config: &BlobAccessConfig,
    storage_type: StorageType,
) -> Result<Arc<dyn BlobAccess>, ConfigError> {
    match config {
        BlobAccessConfig::Local {
            path,
            block_size_bytes,
            digest_location_map_size,
            digest_location_map_maximum_get_attempts,
            digest_location_map_maximum_put_attempts,
            old_blocks,
            current_blocks,
            new_blocks,
            instances,
        } => {
            let backend = LocalBlobAccess::new(
                LocalBlobAccessOptions {
                    path: Path::new(path),
                    block_size_bytes: *block_size_bytes,
                    old_blocks: *old_blocks,
                    current_blocks: *current_blocks,
                    new_blocks: *new_blocks,
                    digest_location_map_size: *digest_location_map_size,
                    digest_location_map_maximum_get_attempts:
                        *digest_location_map_maximum_get_attempts,
                    digest_location_map_maximum_put_attempts:
                        *digest_location_map_maximum_put_attempts,
                    instances: instances.clone(),
                },
                storage_type,
            )?;
            Ok(Arc::new(backend))
        }
        BlobAccessConfig::Circular {
            directory,
            offset_file_size_bytes,
            data_file_size_bytes,
            offset_cache_size,
            data_allocation_chunk_size_bytes,
            instances,
        } => {
            let directory = Path::new(directory);
            std::fs::create_dir_all(directory)?;
            let offset_store = CachingOffsetStore::new(
                FileOffsetStore::open(&directory.join("offset"), *offset_file_size_bytes)?,
                *offset_cache_size,
            );
            let data_store = Arc::new(FileDataStore::open(
                &directory.join("data"),
                *data_file_size_bytes,
            )?);
            let state_store = BulkAllocatingStateStore::new(
                FileStateStore::open(&directory.join("state"), *data_file_size_bytes)?,
                *data_allocation_chunk_size_bytes,
            );
            Ok(Arc::new(CircularBlobAccess::new(
                Box::new(offset_store),
                data_store,
                Box::new(state_store),
                storage_type,
                instances.clone(),
            )))
        }
        BlobAccessConfig::Sharding {
            hash_initialization,
            shards,
        } => {
            let shards = shards
                .iter()
                .map(|shard| {
                    Ok(Shard {
                        backend: shard
                            .backend
                            .as_ref()
                            .map(|backend| new_blob_access(backend, storage_type))
                            .transpose()?,
                        weight: shard.weight,
                    })
                })
                .collect::<Result<Vec<Shard>, ConfigError>>()?;
            Ok(Arc::new(ShardingBlobAccess::new(
                shards,
                *hash_initialization,
                storage_type,
            )?))
        }
        BlobAccessConfig::SizeDistinguishing {
            small,
            large,
            cutoff_size_bytes,
        } => Ok(Arc::new(SizeDistinguishingBlobAccess::new(
            new_blob_access(small, storage_type)?,
            new_blob_access(large, storage_type)?,
            *cutoff_size_bytes,
        ))),
        BlobAccessConfig::ReadCaching { slow, fast } => Ok(Arc::new(ReadCachingBlobAccess::new(
            new_blob_access(slow, storage_type)?,
            new_blob_access(fast, storage_type)?,
            storage_type,
        ))),
        BlobAccessConfig::Mirrored {
            backend_a,
            backend_b,
        } => Ok(Arc::new(MirroredBlobAccess::new(
            new_blob_access(backend_a, storage_type)?,
            new_blob_access(backend_b, storage_type)?,
            storage_type,
        ))),
        BlobAccessConfig::Error { code, message } => {
            Ok(Arc::new(ErrorBlobAccess::new(*code, message)))
        }
        BlobAccessConfig::Remote { address, prefix } => Ok(Arc::new(RemoteBlobAccess::new(
            address,
            prefix,
            storage_type,
        ))),
        BlobAccessConfig::Redis { .. } => Err(ConfigError::Invalid(
            "redis backends are not compiled in".to_string(),
        )),
        BlobAccessConfig::Grpc { .. } => Err(ConfigError::Invalid(
            "grpc backends are not compiled in".to_string(),
        )),
        BlobAccessConfig::Cloud { .. } => Err(ConfigError::Invalid(
            "cloud backends are not compiled in".to_string(),
        )),
    }
}
