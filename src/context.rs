//! Cancellation tokens
//!
//! Every storage operation takes a `Context`. Backends check it at I/O
//! boundaries; a cancelled context makes the operation fail with
//! `DeadlineExceeded` and release its resources.

use crate::blobstore::{StorageError, StorageResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable cancellation token passed through every storage operation.
#[derive(Clone, Debug)]
pub struct Context {
    cancelled: Arc<AtomicBool>,
}

impl Context {
    /// A context that is never cancelled.
    pub fn background() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel this context and every clone of it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with `DeadlineExceeded` if the context has been cancelled.
    pub fn check(&self) -> StorageResult<()> {
        if self.is_cancelled() {
            Err(StorageError::DeadlineExceeded)
        } else {
            Ok(())
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
