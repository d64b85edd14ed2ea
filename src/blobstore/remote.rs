//! HTTP remote cache backend
//!
//! Leaf client for the Bazel HTTP/1.1 remote cache protocol: blobs live
//! at `<address>/<prefix>/<hash>`, GET fetches, HEAD probes, PUT uploads.
//! Buffers served from here are irreparable; there is nothing local to
//! invalidate.

use crate::blobstore::{BlobAccess, StorageError, StorageResult, StorageType};
use crate::buffer::Buffer;
use crate::context::Context;
use crate::digest::Digest;
use reqwest::blocking::{Body, Client};
use reqwest::StatusCode;

pub struct RemoteBlobAccess {
    client: Client,
    address: String,
    prefix: String,
    storage_type: StorageType,
}

impl RemoteBlobAccess {
    pub fn new(address: &str, prefix: &str, storage_type: StorageType) -> Self {
        Self {
            client: Client::new(),
            address: address.trim_end_matches('/').to_string(),
            prefix: prefix.trim_matches('/').to_string(),
            storage_type,
        }
    }

    fn url(&self, digest: &Digest) -> String {
        format!("{}/{}/{}", self.address, self.prefix, digest.hash())
    }

    fn unexpected_status(status: StatusCode) -> StorageError {
        StorageError::Unavailable(format!(
            "unexpected status code from remote cache: {}",
            status
        ))
    }
}

impl BlobAccess for RemoteBlobAccess {
    fn get(&self, ctx: &Context, digest: &Digest) -> StorageResult<Buffer> {
        ctx.check()?;
        let response = self
            .client
            .get(self.url(digest))
            .send()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(StorageError::NotFound),
            StatusCode::OK => {
                let stored_size = response
                    .content_length()
                    .unwrap_or(digest.size_bytes());
                Ok(self.storage_type.new_buffer_from_reader(
                    digest,
                    stored_size,
                    Box::new(response),
                    None,
                ))
            }
            status => Err(Self::unexpected_status(status)),
        }
    }

    fn put(&self, ctx: &Context, digest: &Digest, buffer: Buffer) -> StorageResult<()> {
        if let Err(e) = ctx.check() {
            buffer.discard();
            return Err(e);
        }
        let size_bytes = buffer.size_bytes();
        let reader = buffer.into_reader();
        let response = self
            .client
            .put(self.url(digest))
            .body(Body::sized(reader, size_bytes))
            .send()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::unexpected_status(response.status()))
        }
    }

    fn find_missing(&self, ctx: &Context, digests: &[Digest]) -> StorageResult<Vec<Digest>> {
        let mut missing = Vec::new();
        for digest in digests {
            ctx.check()?;
            let response = self
                .client
                .head(self.url(digest))
                .send()
                .map_err(|e| StorageError::Unavailable(e.to_string()))?;
            match response.status() {
                StatusCode::NOT_FOUND => missing.push(digest.clone()),
                StatusCode::OK => {}
                status => return Err(Self::unexpected_status(status)),
            }
        }
        Ok(missing)
    }
}
