//! Mirrored decorator
//!
//! Two-replica self-healing storage. Writes must land on both replicas;
//! reads load-balance by fingerprint parity and fall through to the peer,
//! replicating the blob back into the failing replica.

use crate::blobstore::{
    key_fingerprint64, BlobAccess, StorageError, StorageResult, StorageType,
};
use crate::buffer::Buffer;
use crate::context::Context;
use crate::digest::Digest;
use std::sync::Arc;
use std::thread;

pub struct MirroredBlobAccess {
    backend_a: Arc<dyn BlobAccess>,
    backend_b: Arc<dyn BlobAccess>,
    storage_type: StorageType,
}

impl MirroredBlobAccess {
    pub fn new(
        backend_a: Arc<dyn BlobAccess>,
        backend_b: Arc<dyn BlobAccess>,
        storage_type: StorageType,
    ) -> Self {
        Self {
            backend_a,
            backend_b,
            storage_type,
        }
    }

    /// Primary replica for a request, balanced by fingerprint parity.
    fn ordered(&self, digest: &Digest) -> (&Arc<dyn BlobAccess>, &Arc<dyn BlobAccess>, &str, &str) {
        let fingerprint = key_fingerprint64(&self.storage_type.digest_key(digest), 0);
        if fingerprint % 2 == 0 {
            (&self.backend_a, &self.backend_b, "A", "B")
        } else {
            (&self.backend_b, &self.backend_a, "B", "A")
        }
    }

    fn falls_through(error: &StorageError) -> bool {
        matches!(
            error,
            StorageError::NotFound | StorageError::DataCorrupted(_) | StorageError::Unavailable(_)
        )
    }
}

/// Copy one blob between replicas.
fn replicate(
    ctx: &Context,
    digest: &Digest,
    storage_type: StorageType,
    source: &Arc<dyn BlobAccess>,
    target: &Arc<dyn BlobAccess>,
) -> StorageResult<()> {
    let data = source.get(ctx, digest)?.into_byte_slice(usize::MAX)?;
    target.put(ctx, digest, storage_type.new_buffer_from_bytes(digest, data))
}

impl BlobAccess for MirroredBlobAccess {
    fn get(&self, ctx: &Context, digest: &Digest) -> StorageResult<Buffer> {
        let (primary, secondary, primary_name, secondary_name) = self.ordered(digest);
        // Corruption only surfaces while the bytes stream, so the
        // primary's buffer is materialized before deciding to fall
        // through. Its repair callback has already fired by then.
        let primary_error = match primary
            .get(ctx, digest)
            .and_then(|buffer| buffer.into_byte_slice(usize::MAX))
        {
            Ok(data) => return Ok(Buffer::from_validated_bytes(data)),
            Err(e) if Self::falls_through(&e) => e,
            Err(e) => return Err(e),
        };
        let data = match secondary
            .get(ctx, digest)
            .and_then(|buffer| buffer.into_byte_slice(usize::MAX))
        {
            Ok(data) => data,
            Err(StorageError::NotFound) => return Err(primary_error),
            Err(e) => return Err(e),
        };
        // Heal the failing replica while the bytes are in hand; an
        // unavailable primary is left alone.
        if !matches!(primary_error, StorageError::Unavailable(_)) {
            let copy = self
                .storage_type
                .new_buffer_from_bytes(digest, data.clone());
            if let Err(e) = primary.put(ctx, digest, copy) {
                log::warn!(
                    "failed to replicate {} from replica {} to replica {}: {}",
                    digest,
                    secondary_name,
                    primary_name,
                    e
                );
            }
        }
        Ok(Buffer::from_validated_bytes(data))
    }

    fn put(&self, ctx: &Context, digest: &Digest, buffer: Buffer) -> StorageResult<()> {
        // The buffer feeds both replicas, so it is materialized once.
        let data = buffer.into_byte_slice(usize::MAX)?;
        let result_a = self.backend_a.put(
            ctx,
            digest,
            self.storage_type.new_buffer_from_bytes(digest, data.clone()),
        );
        let result_b = self.backend_b.put(
            ctx,
            digest,
            self.storage_type.new_buffer_from_bytes(digest, data),
        );
        match (result_a, result_b) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) => {
                log::warn!("put of {} failed on replica A: {}", digest, e);
                Err(e)
            }
            (Ok(()), Err(e)) => {
                log::warn!("put of {} failed on replica B: {}", digest, e);
                Err(e)
            }
            (Err(a), Err(b)) => {
                log::warn!("put of {} failed on both replicas: {} / {}", digest, a, b);
                Err(a)
            }
        }
    }

    fn find_missing(&self, ctx: &Context, digests: &[Digest]) -> StorageResult<Vec<Digest>> {
        let missing_a = self.backend_a.find_missing(ctx, digests)?;
        let missing_b = self.backend_b.find_missing(ctx, digests)?;

        // Digests absent from one replica only are replicated from the
        // other in the background; the caller re-uploads only what both
        // replicas lack.
        let only_a: Vec<Digest> = missing_a
            .iter()
            .filter(|d| !missing_b.contains(d))
            .cloned()
            .collect();
        let only_b: Vec<Digest> = missing_b
            .iter()
            .filter(|d| !missing_a.contains(d))
            .cloned()
            .collect();
        if !only_a.is_empty() || !only_b.is_empty() {
            let backend_a = Arc::clone(&self.backend_a);
            let backend_b = Arc::clone(&self.backend_b);
            let storage_type = self.storage_type;
            thread::spawn(move || {
                let ctx = Context::background();
                for digest in only_a {
                    if let Err(e) = replicate(&ctx, &digest, storage_type, &backend_b, &backend_a) {
                        log::warn!("background replication of {} to replica A failed: {}", digest, e);
                    }
                }
                for digest in only_b {
                    if let Err(e) = replicate(&ctx, &digest, storage_type, &backend_a, &backend_b) {
                        log::warn!("background replication of {} to replica B failed: {}", digest, e);
                    }
                }
            });
        }

        Ok(missing_a
            .into_iter()
            .filter(|d| missing_b.contains(d))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::testing::InMemoryBlobAccess;
    use std::time::Duration;

    fn sha256(data: &[u8]) -> Digest {
        Digest::new("", &"0".repeat(64), 0).unwrap().derive(data)
    }

    fn setup() -> (
        Arc<InMemoryBlobAccess>,
        Arc<InMemoryBlobAccess>,
        MirroredBlobAccess,
    ) {
        let a = Arc::new(InMemoryBlobAccess::new(StorageType::ContentAddressable));
        let b = Arc::new(InMemoryBlobAccess::new(StorageType::ContentAddressable));
        let mirror = MirroredBlobAccess::new(
            Arc::clone(&a) as Arc<dyn BlobAccess>,
            Arc::clone(&b) as Arc<dyn BlobAccess>,
            StorageType::ContentAddressable,
        );
        (a, b, mirror)
    }

    #[test]
    fn test_put_writes_both_replicas() {
        let (a, b, mirror) = setup();
        let ctx = Context::background();
        let digest = sha256(b"mirrored");
        mirror
            .put(&ctx, &digest, Buffer::cas_from_bytes(&digest, b"mirrored".to_vec(), None))
            .unwrap();
        assert!(a.contains(&digest));
        assert!(b.contains(&digest));
    }

    #[test]
    fn test_get_survives_single_replica_loss() {
        let (a, b, mirror) = setup();
        let ctx = Context::background();
        let digest = sha256(b"resilient");
        mirror
            .put(&ctx, &digest, Buffer::cas_from_bytes(&digest, b"resilient".to_vec(), None))
            .unwrap();

        a.remove(&digest);
        assert_eq!(
            mirror.get(&ctx, &digest).unwrap().into_byte_slice(1024).unwrap(),
            b"resilient"
        );

        b.remove(&digest);
        // The previous get healed replica A, so the blob is still there.
        assert_eq!(
            mirror.get(&ctx, &digest).unwrap().into_byte_slice(1024).unwrap(),
            b"resilient"
        );
    }

    #[test]
    fn test_get_heals_failing_replica() {
        let (a, b, mirror) = setup();
        let ctx = Context::background();
        let digest = sha256(b"healing");
        mirror
            .put(&ctx, &digest, Buffer::cas_from_bytes(&digest, b"healing".to_vec(), None))
            .unwrap();

        a.remove(&digest);
        mirror.get(&ctx, &digest).unwrap().discard();
        // Bypassing the decorator shows the blob resident in A again.
        assert!(a.contains(&digest));
        assert!(b.contains(&digest));
    }

    #[test]
    fn test_corruption_on_both_replicas_surfaces() {
        let (a, b, mirror) = setup();
        let ctx = Context::background();
        let digest = sha256(b"clean copy");
        mirror
            .put(&ctx, &digest, Buffer::cas_from_bytes(&digest, b"clean copy".to_vec(), None))
            .unwrap();
        a.corrupt(&digest);
        b.corrupt(&digest);

        // Whichever replica is primary, its corruption falls through to
        // the peer; with both corrupt the get fails as corrupted.
        let result = mirror
            .get(&ctx, &digest)
            .and_then(|buffer| buffer.into_byte_slice(1024));
        assert!(matches!(result, Err(StorageError::DataCorrupted(_))));
    }

    #[test]
    fn test_get_absent_everywhere_is_not_found() {
        let (_a, _b, mirror) = setup();
        assert!(matches!(
            mirror.get(&Context::background(), &sha256(b"nothing")),
            Err(StorageError::NotFound)
        ));
    }

    #[test]
    fn test_find_missing_intersects_and_replicates() {
        let (a, b, mirror) = setup();
        let ctx = Context::background();

        let only_in_a = sha256(b"only in a");
        a.put(&ctx, &only_in_a, Buffer::cas_from_bytes(&only_in_a, b"only in a".to_vec(), None))
            .unwrap();
        let only_in_b = sha256(b"only in b");
        b.put(&ctx, &only_in_b, Buffer::cas_from_bytes(&only_in_b, b"only in b".to_vec(), None))
            .unwrap();
        let nowhere = sha256(b"nowhere");

        let missing = mirror
            .find_missing(
                &ctx,
                &[only_in_a.clone(), only_in_b.clone(), nowhere.clone()],
            )
            .unwrap();
        assert_eq!(missing, vec![nowhere]);

        // Background replication settles both replicas.
        for _ in 0..100 {
            if a.contains(&only_in_b) && b.contains(&only_in_a) {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("background replication did not complete");
    }
}
