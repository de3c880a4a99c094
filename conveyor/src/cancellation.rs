//! Run token for cooperative cancellation.
//!
//! A [`RunToken`] is shared between the orchestrator, the retry layer and
//! long waits; cancelling it interrupts in-progress backoff sleeps and
//! prevents further attempts.

use parking_lot::RwLock;
use tokio::sync::watch;

/// A token for cooperative run cancellation.
///
/// Cancellation is idempotent - only the first cancellation reason is kept.
#[derive(Debug)]
pub struct RunToken {
    /// Broadcasts the cancelled flag to async waiters.
    flag: watch::Sender<bool>,
    /// The reason for cancellation (first one wins).
    reason: RwLock<Option<String>>,
}

impl Default for RunToken {
    fn default() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag,
            reason: RwLock::new(None),
        }
    }
}

impl RunToken {
    /// Creates a new, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation with a reason.
    ///
    /// This is idempotent - only the first reason is kept, and waiters are
    /// woken exactly once.
    pub fn cancel(&self, reason: impl Into<String>) {
        {
            let mut guard = self.reason.write();
            if guard.is_some() {
                return;
            }
            *guard = Some(reason.into());
        }
        self.flag.send_replace(true);
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Resolves once cancellation has been requested.
    ///
    /// Completes immediately if the token is already cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.flag.subscribe();
        if *rx.borrow() {
            return;
        }
        loop {
            // The sender lives inside self, so changed() cannot observe a
            // dropped channel while we hold &self.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
            if *rx.borrow() {
                return;
            }
        }
    }
}
