//! Size-distinguishing decorator
//!
//! Dispatches small blobs to one backend and large blobs to another.

use crate::blobstore::{BlobAccess, StorageResult};
use crate::buffer::Buffer;
use crate::context::Context;
use crate::digest::Digest;
use std::sync::Arc;

pub struct SizeDistinguishingBlobAccess {
    small: Arc<dyn BlobAccess>,
    large: Arc<dyn BlobAccess>,
    cutoff_size_bytes: u64,
}

impl SizeDistinguishingBlobAccess {
    pub fn new(
        small: Arc<dyn BlobAccess>,
        large: Arc<dyn BlobAccess>,
        cutoff_size_bytes: u64,
    ) -> Self {
        Self {
            small,
            large,
            cutoff_size_bytes,
        }
    }

    fn backend_for(&self, digest: &Digest) -> &Arc<dyn BlobAccess> {
        if digest.size_bytes() <= self.cutoff_size_bytes {
            &self.small
        } else {
            &self.large
        }
    }
}

impl BlobAccess for SizeDistinguishingBlobAccess {
    fn get(&self, ctx: &Context, digest: &Digest) -> StorageResult<Buffer> {
        self.backend_for(digest).get(ctx, digest)
    }

    fn put(&self, ctx: &Context, digest: &Digest, buffer: Buffer) -> StorageResult<()> {
        self.backend_for(digest).put(ctx, digest, buffer)
    }

    fn find_missing(&self, ctx: &Context, digests: &[Digest]) -> StorageResult<Vec<Digest>> {
        let (small, large): (Vec<Digest>, Vec<Digest>) = digests
            .iter()
            .cloned()
            .partition(|d| d.size_bytes() <= self.cutoff_size_bytes);
        let mut missing = self.small.find_missing(ctx, &small)?;
        missing.extend(self.large.find_missing(ctx, &large)?);
        Ok(missing)
    }
}
