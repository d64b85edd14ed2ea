//! Configuration file parsing
//!
//! Parses TOML configuration files describing the server and the two
//! backend trees: one for the content-addressable storage, one for the
//! action cache.

use crate::blobstore::error::ErrorCode;
use crate::blobstore::StorageError;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to create backend: {0}")]
    Backend(#[from] StorageError),
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server settings
    pub server: ServerConfig,

    /// Backend tree for content-addressable storage
    pub content_addressable_storage: BlobAccessConfig,

    /// Backend tree for the action cache
    pub action_cache: BlobAccessConfig,
}

/// Server settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_get_attempts() -> u32 {
    8
}

fn default_put_attempts() -> u32 {
    32
}

fn default_old_blocks() -> usize {
    8
}

fn default_current_blocks() -> usize {
    24
}

fn default_new_blocks() -> usize {
    3
}

/// Recursive backend configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BlobAccessConfig {
    Local {
        /// Backing file for the block ring
        path: String,
        block_size_bytes: u64,
        /// Slots in the digest-location map; 2-10x the expected object count
        digest_location_map_size: usize,
        #[serde(default = "default_get_attempts")]
        digest_location_map_maximum_get_attempts: u32,
        #[serde(default = "default_put_attempts")]
        digest_location_map_maximum_put_attempts: u32,
        #[serde(default = "default_old_blocks")]
        old_blocks: usize,
        #[serde(default = "default_current_blocks")]
        current_blocks: usize,
        #[serde(default = "default_new_blocks")]
        new_blocks: usize,
        /// Required for the action cache, unused for CAS
        #[serde(default)]
        instances: Vec<String>,
    },
    Circular {
        directory: String,
        offset_file_size_bytes: u64,
        data_file_size_bytes: u64,
        offset_cache_size: usize,
        data_allocation_chunk_size_bytes: u64,
        #[serde(default)]
        instances: Vec<String>,
    },
    Sharding {
        /// Deployment-unique seed for shard selection
        hash_initialization: u64,
        shards: Vec<ShardConfig>,
    },
    SizeDistinguishing {
        small: Box<BlobAccessConfig>,
        large: Box<BlobAccessConfig>,
        cutoff_size_bytes: u64,
    },
    ReadCaching {
        slow: Box<BlobAccessConfig>,
        fast: Box<BlobAccessConfig>,
    },
    Mirrored {
        backend_a: Box<BlobAccessConfig>,
        backend_b: Box<BlobAccessConfig>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Remote {
        address: String,
        #[serde(default)]
        prefix: String,
    },
    Redis {
        address: String,
    },
    Grpc {
        address: String,
    },
    Cloud {
        bucket: String,
    },
}

/// One shard of a sharding backend
#[derive(Debug, Clone, Deserialize)]
pub struct ShardConfig {
    /// Absent marks a drained shard; its weight still counts
    #[serde(default)]
    pub backend: Option<Box<BlobAccessConfig>>,

    /// Routing weight, must be positive
    pub weight: u64,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        validate_backend(&self.content_addressable_storage, false)?;
        validate_backend(&self.action_cache, true)
    }
}

fn validate_backend(config: &BlobAccessConfig, action_cache: bool) -> Result<(), ConfigError> {
    match config {
        BlobAccessConfig::Local {
            block_size_bytes,
            digest_location_map_size,
            digest_location_map_maximum_get_attempts,
            old_blocks,
            current_blocks,
            new_blocks,
            instances,
            ..
        } => {
            if *block_size_bytes == 0 || *digest_location_map_size == 0 {
                return Err(ConfigError::Invalid(
                    "local backend needs non-zero block and map sizes".to_string(),
                ));
            }
            if *digest_location_map_maximum_get_attempts == 0 {
                return Err(ConfigError::Invalid(
                    "local backend needs at least one get attempt".to_string(),
                ));
            }
            if *old_blocks == 0 || *current_blocks == 0 || *new_blocks == 0 {
                return Err(ConfigError::Invalid(
                    "local backend needs at least one block per partition".to_string(),
                ));
            }
            if *new_blocks > 4 {
                return Err(ConfigError::Invalid(format!(
                    "local backend supports at most 4 new blocks, got {}",
                    new_blocks
                )));
            }
            if action_cache && instances.is_empty() {
                return Err(ConfigError::Invalid(
                    "action cache backends must declare their instances".to_string(),
                ));
            }
            Ok(())
        }
        BlobAccessConfig::Circular {
            offset_file_size_bytes,
            data_file_size_bytes,
            data_allocation_chunk_size_bytes,
            instances,
            ..
        } => {
            if *offset_file_size_bytes == 0
                || *data_file_size_bytes == 0
                || *data_allocation_chunk_size_bytes == 0
            {
                return Err(ConfigError::Invalid(
                    "circular backend needs non-zero file and chunk sizes".to_string(),
                ));
            }
            if action_cache && instances.is_empty() {
                return Err(ConfigError::Invalid(
                    "action cache backends must declare their instances".to_string(),
                ));
            }
            Ok(())
        }
        BlobAccessConfig::Sharding { shards, .. } => {
            if shards.is_empty() {
                return Err(ConfigError::Invalid(
                    "sharding backend needs at least one shard".to_string(),
                ));
            }
            if shards.iter().any(|s| s.weight == 0) {
                return Err(ConfigError::Invalid(
                    "shard weights must be positive".to_string(),
                ));
            }
            if !shards.iter().any(|s| s.backend.is_some()) {
                return Err(ConfigError::Invalid(
                    "sharding backend needs at least one undrained shard".to_string(),
                ));
            }
            for shard in shards {
                if let Some(backend) = &shard.backend {
                    validate_backend(backend, action_cache)?;
                }
            }
            Ok(())
        }
        BlobAccessConfig::SizeDistinguishing { small, large, .. } => {
            validate_backend(small, action_cache)?;
            validate_backend(large, action_cache)
        }
        BlobAccessConfig::ReadCaching { slow, fast } => {
            validate_backend(slow, action_cache)?;
            validate_backend(fast, action_cache)
        }
        BlobAccessConfig::Mirrored {
            backend_a,
            backend_b,
        } => {
            validate_backend(backend_a, action_cache)?;
            validate_backend(backend_b, action_cache)
        }
        BlobAccessConfig::Error { .. }
        | BlobAccessConfig::Remote { .. }
        | BlobAccessConfig::Redis { .. }
        | BlobAccessConfig::Grpc { .. }
        | BlobAccessConfig::Cloud { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config = Config::parse(
            r#"
[server]
bind = "127.0.0.1:8981"

[content_addressable_storage]
backend = "local"
path = "/var/lib/blobcache/cas-blocks"
block_size_bytes = 1048576
digest_location_map_size = 65536

[action_cache]
backend = "circular"
directory = "/var/lib/blobcache/ac"
offset_file_size_bytes = 1048576
data_file_size_bytes = 104857600
offset_cache_size = 1024
data_allocation_chunk_size_bytes = 1048576
instances = ["default"]
"#,
        )
        .unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8981");
        assert_eq!(config.server.log_level, "info");
        match &config.content_addressable_storage {
            BlobAccessConfig::Local {
                digest_location_map_maximum_get_attempts,
                digest_location_map_maximum_put_attempts,
                old_blocks,
                current_blocks,
                new_blocks,
                ..
            } => {
                assert_eq!(*digest_location_map_maximum_get_attempts, 8);
                assert_eq!(*digest_location_map_maximum_put_attempts, 32);
                assert_eq!(*old_blocks, 8);
                assert_eq!(*current_blocks, 24);
                assert_eq!(*new_blocks, 3);
            }
            other => panic!("expected local backend, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_nested_tree() {
        let config = Config::parse(
            r#"
[server]
bind = "127.0.0.1:8981"

[content_addressable_storage]
backend = "read_caching"

[content_addressable_storage.fast]
backend = "local"
path = "/fast/blocks"
block_size_bytes = 1048576
digest_location_map_size = 4096

[content_addressable_storage.slow]
backend = "sharding"
hash_initialization = 81985529216486895

[[content_addressable_storage.slow.shards]]
weight = 2

[content_addressable_storage.slow.shards.backend]
backend = "remote"
address = "http://cache-a.example.com"
prefix = "cas"

[[content_addressable_storage.slow.shards]]
weight = 1

[action_cache]
backend = "error"
code = "unavailable"
message = "action cache offline"
"#,
        )
        .unwrap();
        match &config.content_addressable_storage {
            BlobAccessConfig::ReadCaching { slow, .. } => match slow.as_ref() {
                BlobAccessConfig::Sharding {
                    hash_initialization,
                    shards,
                } => {
                    assert_eq!(*hash_initialization, 0x0123_4567_89ab_cdef);
                    assert_eq!(shards.len(), 2);
                    assert!(shards[0].backend.is_some());
                    assert!(shards[1].backend.is_none());
                }
                other => panic!("expected sharding, got {:?}", other),
            },
            other => panic!("expected read_caching, got {:?}", other),
        }
    }

    #[test]
    fn test_action_cache_requires_instances() {
        let result = Config::parse(
            r#"
[server]
bind = "127.0.0.1:8981"

[content_addressable_storage]
backend = "error"
code = "unavailable"
message = "offline"

[action_cache]
backend = "local"
path = "/ac/blocks"
block_size_bytes = 1048576
digest_location_map_size = 4096
"#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_weight_rejected() {
        let result = Config::parse(
            r#"
[server]
bind = "127.0.0.1:8981"

[content_addressable_storage]
backend = "sharding"
hash_initialization = 1

[[content_addressable_storage.shards]]
weight = 0

[content_addressable_storage.shards.backend]
backend = "error"
code = "internal"
message = "x"

[action_cache]
backend = "error"
code = "unavailable"
message = "offline"
"#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_too_many_new_blocks_rejected() {
        let result = Config::parse(
            r#"
[server]
bind = "127.0.0.1:8981"

[content_addressable_storage]
backend = "local"
path = "/cas/blocks"
block_size_bytes = 1048576
digest_location_map_size = 4096
new_blocks = 5

[action_cache]
backend = "error"
code = "unavailable"
message = "offline"
"#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
