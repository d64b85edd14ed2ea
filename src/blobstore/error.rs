//! Error leaf
//!
//! A backend that fails every operation with a fixed status. Used to
//! model partially configured trees and to exercise failure paths.

use crate::blobstore::{BlobAccess, StorageError, StorageResult};
use crate::buffer::Buffer;
use crate::context::Context;
use crate::digest::Digest;
use serde::Deserialize;

/// Which error kind the leaf produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    InvalidArgument,
    DataCorrupted,
    ResourceExhausted,
    Unavailable,
    DeadlineExceeded,
    Internal,
}

pub struct ErrorBlobAccess {
    code: ErrorCode,
    message: String,
}

impl ErrorBlobAccess {
    pub fn new(code: ErrorCode, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }

    fn status(&self) -> StorageError {
        match self.code {
            ErrorCode::NotFound => StorageError::NotFound,
            ErrorCode::InvalidArgument => StorageError::InvalidArgument(self.message.clone()),
            ErrorCode::DataCorrupted => StorageError::DataCorrupted(self.message.clone()),
            ErrorCode::ResourceExhausted => StorageError::ResourceExhausted(self.message.clone()),
            ErrorCode::Unavailable => StorageError::Unavailable(self.message.clone()),
            ErrorCode::DeadlineExceeded => StorageError::DeadlineExceeded,
            ErrorCode::Internal => StorageError::Internal(self.message.clone()),
        }
    }
}

impl BlobAccess for ErrorBlobAccess {
    fn get(&self, _ctx: &Context, _digest: &Digest) -> StorageResult<Buffer> {
        Err(self.status())
    }

    fn put(&self, _ctx: &Context, _digest: &Digest, buffer: Buffer) -> StorageResult<()> {
        buffer.discard();
        Err(self.status())
    }

    fn find_missing(&self, _ctx: &Context, _digests: &[Digest]) -> StorageResult<Vec<Digest>> {
        Err(self.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_operation_fails_with_the_configured_status() {
        let backend = ErrorBlobAccess::new(ErrorCode::Unavailable, "maintenance window");
        let ctx = Context::background();
        let digest = Digest::new("", &"a".repeat(64), 1).unwrap();

        assert!(matches!(
            backend.get(&ctx, &digest),
            Err(StorageError::Unavailable(_))
        ));
        assert!(matches!(
            backend.put(&ctx, &digest, Buffer::from_validated_bytes(b"x".to_vec())),
            Err(StorageError::Unavailable(_))
        ));
        assert!(matches!(
            backend.find_missing(&ctx, &[digest]),
            Err(StorageError::Unavailable(_))
        ));
    }
}
