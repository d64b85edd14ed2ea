//! Read-caching decorator
//!
//! Writes go to the slow backend only; reads try the fast backend first
//! and populate it from the slow one on a miss. The fast backend is a
//! cache: find_missing consults the slow backend alone.

use crate::blobstore::{BlobAccess, StorageError, StorageResult, StorageType};
use crate::buffer::Buffer;
use crate::context::Context;
use crate::digest::Digest;
use std::sync::Arc;

pub struct ReadCachingBlobAccess {
    slow: Arc<dyn BlobAccess>,
    fast: Arc<dyn BlobAccess>,
    storage_type: StorageType,
}

impl ReadCachingBlobAccess {
    pub fn new(
        slow: Arc<dyn BlobAccess>,
        fast: Arc<dyn BlobAccess>,
        storage_type: StorageType,
    ) -> Self {
        Self {
            slow,
            fast,
            storage_type,
        }
    }
}

impl BlobAccess for ReadCachingBlobAccess {
    fn get(&self, ctx: &Context, digest: &Digest) -> StorageResult<Buffer> {
        match self.fast.get(ctx, digest) {
            Ok(buffer) => return Ok(buffer),
            Err(StorageError::NotFound) => {}
            Err(e) => return Err(e),
        }
        // Read the blob out of the slow backend once; the client and the
        // cache population share that single pass.
        let data = self.slow.get(ctx, digest)?.into_byte_slice(usize::MAX)?;
        let populate = self
            .storage_type
            .new_buffer_from_bytes(digest, data.clone());
        if let Err(e) = self.fast.put(ctx, digest, populate) {
            log::warn!("failed to populate read cache with {}: {}", digest, e);
        }
        Ok(Buffer::from_validated_bytes(data))
    }

    fn put(&self, ctx: &Context, digest: &Digest, buffer: Buffer) -> StorageResult<()> {
        self.slow.put(ctx, digest, buffer)
    }

    fn find_missing(&self, ctx: &Context, digests: &[Digest]) -> StorageResult<Vec<Digest>> {
        self.slow.find_missing(ctx, digests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::testing::InMemoryBlobAccess;

    fn sha256(data: &[u8]) -> Digest {
        Digest::new("", &"0".repeat(64), 0).unwrap().derive(data)
    }

    fn setup() -> (
        Arc<InMemoryBlobAccess>,
        Arc<InMemoryBlobAccess>,
        ReadCachingBlobAccess,
    ) {
        let slow = Arc::new(InMemoryBlobAccess::new(StorageType::ContentAddressable));
        let fast = Arc::new(InMemoryBlobAccess::new(StorageType::ContentAddressable));
        let caching = ReadCachingBlobAccess::new(
            Arc::clone(&slow) as Arc<dyn BlobAccess>,
            Arc::clone(&fast) as Arc<dyn BlobAccess>,
            StorageType::ContentAddressable,
        );
        (slow, fast, caching)
    }

    #[test]
    fn test_put_bypasses_fast() {
        let (slow, fast, caching) = setup();
        let ctx = Context::background();
        let digest = sha256(b"payload");
        caching
            .put(&ctx, &digest, Buffer::cas_from_bytes(&digest, b"payload".to_vec(), None))
            .unwrap();
        assert!(slow.contains(&digest));
        assert!(!fast.contains(&digest));
    }

    #[test]
    fn test_get_populates_fast_on_miss() {
        let (slow, fast, caching) = setup();
        let ctx = Context::background();
        let digest = sha256(b"payload");
        slow.put(&ctx, &digest, Buffer::cas_from_bytes(&digest, b"payload".to_vec(), None))
            .unwrap();

        let data = caching
            .get(&ctx, &digest)
            .unwrap()
            .into_byte_slice(1024)
            .unwrap();
        assert_eq!(data, b"payload");
        assert!(fast.contains(&digest));

        // A second read is served out of the cache even if the slow
        // backend loses the blob.
        slow.remove(&digest);
        let data = caching
            .get(&ctx, &digest)
            .unwrap()
            .into_byte_slice(1024)
            .unwrap();
        assert_eq!(data, b"payload");
    }

    #[test]
    fn test_get_absent_everywhere_is_not_found() {
        let (_slow, _fast, caching) = setup();
        assert!(matches!(
            caching.get(&Context::background(), &sha256(b"nothing")),
            Err(StorageError::NotFound)
        ));
    }

    #[test]
    fn test_find_missing_ignores_fast() {
        let (_slow, fast, caching) = setup();
        let ctx = Context::background();
        let digest = sha256(b"cache only");
        fast.put(&ctx, &digest, Buffer::cas_from_bytes(&digest, b"cache only".to_vec(), None))
            .unwrap();
        // Present in the cache but absent from the source of truth.
        let missing = caching.find_missing(&ctx, &[digest.clone()]).unwrap();
        assert_eq!(missing, vec![digest]);
    }
}
