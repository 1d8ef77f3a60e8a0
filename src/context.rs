//! Operation context: cooperative cancellation plus an optional deadline.
//!
//! A single [`Context`] governs one bulk operation. Every suspension point in the engine
//! (rate-limiter waits, retry backoff, queue sends, semaphore acquisition) races against
//! [`Context::done`], so cancelling the context unblocks all of them.
//!
//! Deadlines are read from `tokio::time::Instant`, which lets tests drive them with a paused
//! clock.
//!
//! ```rust
//! use bulkline::{Context, ContextError};
//! use std::time::Duration;
//!
//! let root = Context::new();
//! let scoped = root.with_timeout(Duration::from_secs(5));
//! root.cancel();
//! assert_eq!(scoped.err(), Some(ContextError::Cancelled));
//! ```

use crate::error::ContextError;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation token paired with an optional deadline.
///
/// Clones share the same token; derived contexts ([`Context::child`], [`Context::with_timeout`])
/// are cancelled when their parent is, but cancelling a child leaves the parent untouched.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A fresh root context with no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing cancellation token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self { token, deadline: None }
    }

    /// Derive a child context that inherits the deadline.
    pub fn child(&self) -> Self {
        Self { token: self.token.child_token(), deadline: self.deadline }
    }

    /// Derive a child whose deadline is the earlier of the parent's and `now + timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now().checked_add(timeout);
        self.with_deadline_opt(candidate)
    }

    /// Derive a child whose deadline is the earlier of the parent's and `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        self.with_deadline_opt(Some(deadline))
    }

    fn with_deadline_opt(&self, candidate: Option<Instant>) -> Self {
        let deadline = match (self.deadline, candidate) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self { token: self.token.child_token(), deadline }
    }

    /// The deadline, if one was set on this context or an ancestor.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Underlying token, for integration with code that speaks `tokio_util` directly.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Why the context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolve once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => ContextError::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                ContextError::Cancelled
            }
        }
    }

    /// Sleep for `duration` unless the context finishes first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
