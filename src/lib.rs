//! Content-addressed blob store for remote build caching
//!
//! This crate implements the storage engine behind a remote build cache:
//! clients identify blobs by digest and read or write them through a
//! uniform BlobAccess interface. Backend trees are composed from local
//! block-ring storage, circular file storage, remote caches and a small
//! algebra of decorators.

pub mod blobstore;
pub mod buffer;
pub mod config;
pub mod context;
pub mod digest;
pub mod server;

pub use blobstore::{BlobAccess, StorageError, StorageResult, StorageType};
pub use buffer::Buffer;
pub use config::Config;
pub use context::Context;
pub use digest::Digest;
