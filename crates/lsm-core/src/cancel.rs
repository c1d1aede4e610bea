//! Cooperative cancellation of long-running sweeps and live loops.
//!
//! A [`CancelFlag`] is cloned into the task that runs the work; the owner
//! calls [`CancelFlag::cancel`] and the worker stops at its next check, or
//! as soon as [`CancelFlag::cancelled`] resolves when it races an await.

use std::sync::Arc;

use tokio::sync::watch;

/// Shared cancellation request.
#[derive(Debug, Clone)]
pub struct CancelFlag(Arc<watch::Sender<bool>>);

impl Default for CancelFlag {
    fn default() -> Self {
        Self(Arc::new(watch::channel(false).0))
    }
}

impl CancelFlag {
    /// Create a flag that is not set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Clear a previous request.
    pub fn reset(&self) {
        self.0.send_replace(false);
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.0.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}
