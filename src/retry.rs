//! Retry policy for fallible async operations.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial call + retries).
//! - Only `BulkError::Inner(E)` values are candidates for retry. Cancellation, deadline,
//!   circuit-open and rate-limit errors pass through verbatim after a single attempt.
//! - An inner error is retryable when the custom predicate says so, or, without a predicate,
//!   when its message matches one of the configured retryable substrings (case-insensitive).
//! - When the loop gives up on an inner error it returns `BulkError::Failed`, which records the
//!   attempt count and the most recent failures.
//! - Backoff sleeps race the [`Context`]; cancelling it ends the loop immediately.
//!
//! ```rust
//! use bulkline::{BulkError, Context, RetryPolicy};
//! use std::time::Duration;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let policy = RetryPolicy::<std::io::Error>::builder()
//!     .max_attempts(3)
//!     .initial_delay(Duration::from_millis(10))
//!     .build()
//!     .unwrap();
//! let result: Result<u32, BulkError<std::io::Error>> =
//!     policy.execute(&Context::new(), || async { Ok(7) }).await;
//! assert_eq!(result.unwrap(), 7);
//! # });
//! ```

use crate::backoff::Backoff;
use crate::classify::{matches_any, DEFAULT_RETRYABLE_ERRORS};
use crate::context::Context;
use crate::error::{BulkError, ConfigError, MAX_RECORDED_FAILURES};
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

type Predicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Retry policy combining backoff, jitter, retryability classification and a sleeper.
pub struct RetryPolicy<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    retryable: Arc<Vec<String>>,
    should_retry: Option<Predicate<E>>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            backoff: self.backoff.clone(),
            jitter: self.jitter,
            retryable: self.retryable.clone(),
            should_retry: self.should_retry.clone(),
            sleeper: self.sleeper.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("retryable", &self.retryable)
            .field("should_retry", &self.should_retry.as_ref().map(|_| "<predicate>"))
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

impl<E> RetryPolicy<E>
where
    E: fmt::Display + Send + Sync + 'static,
{
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Whether `err`, produced by attempt number `attempt` (1-based), deserves another try.
    pub fn should_retry(&self, err: &BulkError<E>, attempt: usize) -> bool {
        match err {
            BulkError::Inner(e) => self.is_retryable_inner(e, attempt),
            _ => false,
        }
    }

    fn is_retryable_inner(&self, err: &E, attempt: usize) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match &self.should_retry {
            Some(predicate) => predicate(err),
            None => matches_any(&err.to_string(), &self.retryable),
        }
    }

    /// Backoff delay after failed attempt `attempt`, with jitter applied.
    pub fn next_delay(&self, attempt: usize) -> Duration {
        self.jitter.apply(self.backoff.delay(attempt))
    }

    /// Run `operation` until it succeeds, fails terminally, or attempts run out.
    pub async fn execute<T, Fut, Op>(
        &self,
        ctx: &Context,
        mut operation: Op,
    ) -> Result<T, BulkError<E>>
    where
        Fut: Future<Output = Result<T, BulkError<E>>>,
        Op: FnMut() -> Fut,
    {
        let mut failures: VecDeque<E> = VecDeque::new();
        let mut attempt = 0usize;

        loop {
            if let Some(err) = ctx.err() {
                return Err(err.into());
            }
            attempt += 1;

            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(BulkError::Inner(e)) => e,
                Err(other) => return Err(other),
            };

            let retry = self.is_retryable_inner(&err, attempt);
            if !retry {
                debug!(attempt, error = %err, "giving up");
            }
            failures.push_back(err);
            while failures.len() > MAX_RECORDED_FAILURES {
                failures.pop_front();
            }
            if !retry {
                return Err(BulkError::failed(attempt, failures.into()));
            }

            let delay = self.next_delay(attempt);
            debug!(
                attempt,
                max_attempts = self.max_attempts,
                ?delay,
                error = %failures.back().map(ToString::to_string).unwrap_or_default(),
                "retrying after failure"
            );
            tokio::select! {
                biased;
                err = ctx.done() => return Err(err.into()),
                _ = self.sleeper.sleep(delay) => {}
            }
        }
    }
}

/// Free-function form of [`RetryPolicy::execute`].
pub async fn retry<T, E, Fut, Op>(
    ctx: &Context,
    policy: &RetryPolicy<E>,
    operation: Op,
) -> Result<T, BulkError<E>>
where
    E: fmt::Display + Send + Sync + 'static,
    Fut: Future<Output = Result<T, BulkError<E>>>,
    Op: FnMut() -> Fut,
{
    policy.execute(ctx, operation).await
}

/// Builder for [`RetryPolicy`].
pub struct RetryPolicyBuilder<E> {
    max_attempts: usize,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
    retryable: Vec<String>,
    should_retry: Option<Predicate<E>>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> RetryPolicyBuilder<E>
where
    E: fmt::Display + Send + Sync + 'static,
{
    /// Defaults: 3 attempts, 1s initial delay doubling to a 30s cap, ±10% jitter, and the
    /// [`DEFAULT_RETRYABLE_ERRORS`] classifiers.
    pub fn new() -> Self {
        let backoff = Backoff::default();
        Self {
            max_attempts: 3,
            initial_delay: backoff.initial(),
            max_delay: backoff.max(),
            multiplier: backoff.multiplier(),
            jitter: Jitter::default().fraction(),
            retryable: DEFAULT_RETRYABLE_ERRORS.iter().map(|s| s.to_string()).collect(),
            should_retry: None,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Jitter fraction in `[0.0, 1.0]`.
    pub fn jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction;
        self
    }

    /// Replace the retryable-message substrings.
    pub fn retryable_errors<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Classify inner errors with a predicate instead of message matching.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> Result<RetryPolicy<E>, ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(0));
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: Backoff::new(self.initial_delay, self.max_delay, self.multiplier)?,
            jitter: Jitter::new(self.jitter)?,
            retryable: Arc::new(self.retryable),
            should_retry: self.should_retry,
            sleeper: self.sleeper,
        })
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: fmt::Display + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
