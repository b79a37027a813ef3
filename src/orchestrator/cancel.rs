//! Per-run cancellation flag.
//!
//! Built on a `tokio::sync::watch` channel so that blocking code can poll it
//! and async code can await it (e.g. racing it against a child process).
//! Once signalled it stays signalled; create a fresh token for the next run.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct CancellationToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        CancellationToken { tx: Arc::new(tx) }
    }

    /// Signal cancellation. Idempotent and non-blocking.
    pub fn cancel(&self) {
        self.tx.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        });
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the token has been signalled (immediately if it already is).
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives inside `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Fail fast with the cancellation condition if signalled.
    pub fn check(&self) -> Result<(), crate::error::EngineError> {
        if self.is_cancelled() {
            Err(crate::error::EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
