//! Error types for the batch execution engine
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Cap the number of stored failures inside `Failed` to avoid unbounded growth.
pub const MAX_RECORDED_FAILURES: usize = 10;

/// Why a [`Context`](crate::Context) finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context canceled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Failures raised by a token bucket while waiting for capacity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// The wait deadline passed before enough tokens accumulated.
    #[error("rate limit wait timed out after {waited:?} waiting for {requested} token(s)")]
    Timeout { waited: Duration, requested: u32 },
    /// The request can never be satisfied because it exceeds the bucket capacity.
    #[error("requested {requested} token(s) exceeds burst capacity {burst}")]
    ExceedsBurst { requested: u32, burst: u32 },
    /// The governing context finished first.
    #[error("rate limit wait interrupted: {0}")]
    Context(#[from] ContextError),
}

/// Invalid engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("batch size must be > 0")]
    InvalidBatchSize,
    #[error("concurrency must be > 0")]
    InvalidConcurrency,
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
    #[error("multiplier must be finite and >= 1.0 (got {0})")]
    InvalidMultiplier(String),
    #[error("jitter must be within [0.0, 1.0] (got {0})")]
    InvalidJitter(String),
    #[error("max_delay ({max:?}) must be >= initial_delay ({initial:?})")]
    MaxDelayBelowInitial { initial: Duration, max: Duration },
    #[error("max_failures must be > 0")]
    InvalidMaxFailures,
    #[error("reset_timeout must be > 0")]
    InvalidResetTimeout,
}

/// Unified error type for everything the engine does on behalf of an operation.
///
/// `E` is the caller's operation error; every other variant is produced by the engine itself.
#[derive(Debug, Clone)]
pub enum BulkError<E> {
    /// The governing context was cancelled. Never retried.
    Cancelled,
    /// The governing context's deadline passed. Never retried.
    DeadlineExceeded,
    /// Waiting on a token bucket failed.
    RateLimited(RateLimitError),
    /// The named circuit breaker refused the call without invoking the operation.
    CircuitOpen { name: String, failure_count: usize, open_for: Duration },
    /// The operation kept failing; `failures` holds the most recent attempts' errors.
    Failed { attempts: usize, failures: Arc<Vec<E>> },
    /// The underlying operation failed.
    Inner(E),
    /// The operation panicked; holds the panic message.
    Panicked(String),
}

impl<E: fmt::Display> fmt::Display for BulkError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "{}", ContextError::Cancelled),
            Self::DeadlineExceeded => write!(f, "{}", ContextError::DeadlineExceeded),
            Self::RateLimited(e) => write!(f, "{}", e),
            Self::CircuitOpen { name, failure_count, open_for } => write!(
                f,
                "circuit breaker {} is open ({} failures, open for {:?})",
                name, failure_count, open_for
            ),
            Self::Failed { attempts, failures } => match failures.last() {
                Some(last) => write!(f, "operation failed after {} attempts: {}", attempts, last),
                None => write!(f, "operation failed after {} attempts", attempts),
            },
            Self::Inner(e) => write!(f, "{}", e),
            Self::Panicked(msg) => write!(f, "operation panicked: {}", msg),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BulkError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Failed { failures, .. } => failures.last().map(|e| e as &dyn std::error::Error),
            Self::RateLimited(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<ContextError> for BulkError<E> {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => Self::Cancelled,
            ContextError::DeadlineExceeded => Self::DeadlineExceeded,
        }
    }
}

impl<E> From<RateLimitError> for BulkError<E> {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Context(ctx) => ctx.into(),
            other => Self::RateLimited(other),
        }
    }
}

impl<E> BulkError<E> {
    /// Construct `Failed`, keeping only the most recent `MAX_RECORDED_FAILURES` errors.
    pub fn failed(attempts: usize, failures: Vec<E>) -> Self {
        let trimmed = if failures.len() > MAX_RECORDED_FAILURES {
            let skip = failures.len() - MAX_RECORDED_FAILURES;
            failures.into_iter().skip(skip).collect()
        } else {
            failures
        };
        BulkError::Failed { attempts, failures: Arc::new(trimmed) }
    }

    /// True for cancellation and deadline errors of the governing context.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    pub fn is_panicked(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Number of attempts made, when the error came out of a retry loop.
    pub fn attempts(&self) -> Option<usize> {
        match self {
            Self::Failed { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// The operation error closest to the surface: `Inner`, or the last recorded failure.
    pub fn last_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Failed { failures, .. } => failures.last(),
            _ => None,
        }
    }

    /// All recorded failures for `Failed`, if present.
    pub fn failures(&self) -> Option<&[E]> {
        match self {
            Self::Failed { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}
