//! Retry policy composed with per-operation circuit breakers.
//!
//! Each operation name gets its own [`CircuitBreaker`], created on first use; all names share one
//! [`RetryPolicy`]. Every attempt of [`RetryManager::execute_with_retry`] goes through the
//! breaker, so once a breaker opens the remaining attempts fail fast.

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::context::Context;
use crate::error::{BulkError, ConfigError};
use crate::retry::RetryPolicy;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// Breaker threshold used by [`RetryManager::new`].
pub const DEFAULT_MAX_FAILURES: usize = 5;
/// Breaker cooldown used by [`RetryManager::new`].
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RetryManager<E> {
    policy: RetryPolicy<E>,
    breakers: RwLock<HashMap<String, CircuitBreaker>>,
    max_failures: usize,
    reset_timeout: Duration,
}

impl<E> fmt::Debug for RetryManager<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryManager")
            .field("policy", &self.policy)
            .field("max_failures", &self.max_failures)
            .field("reset_timeout", &self.reset_timeout)
            .finish_non_exhaustive()
    }
}

impl<E> RetryManager<E>
where
    E: fmt::Display + Send + Sync + 'static,
{
    /// Breakers trip after 5 consecutive failures and cool down for 30s.
    pub fn new(policy: RetryPolicy<E>) -> Self {
        Self {
            policy,
            breakers: RwLock::new(HashMap::new()),
            max_failures: DEFAULT_MAX_FAILURES,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
        }
    }

    /// Custom breaker settings for breakers created from now on.
    pub fn with_breaker_settings(
        mut self,
        max_failures: usize,
        reset_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        // Validate once up front so lazy creation cannot fail later.
        CircuitBreaker::new("validation", max_failures, reset_timeout)?;
        self.max_failures = max_failures;
        self.reset_timeout = reset_timeout;
        Ok(self)
    }

    pub fn policy(&self) -> &RetryPolicy<E> {
        &self.policy
    }

    /// Breaker for `name`, created on first use.
    pub fn breaker(&self, name: &str) -> CircuitBreaker {
        {
            let map = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = map.get(name) {
                return existing.clone();
            }
        }
        let mut map = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = map.get(name) {
            return existing.clone();
        }
        let breaker =
            CircuitBreaker::with_validated(name.to_string(), self.max_failures, self.reset_timeout);
        tracing::debug!(breaker = name, "creating circuit breaker");
        map.insert(name.to_string(), breaker.clone());
        breaker
    }

    /// Install a pre-built breaker (for example one with a test clock) under its name.
    pub fn insert_breaker(&self, breaker: CircuitBreaker) {
        let mut map = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        if map.insert(breaker.name().to_string(), breaker).is_some() {
            tracing::warn!("circuit breaker replaced; last registration wins");
        }
    }

    /// Run `operation` with retries, every attempt guarded by the breaker named `name`.
    pub async fn execute_with_retry<T, Fut, Op>(
        &self,
        ctx: &Context,
        name: &str,
        mut operation: Op,
    ) -> Result<T, BulkError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnMut() -> Fut,
    {
        self.execute_guarded(ctx, name, || {
            let attempt = operation();
            async move { attempt.await.map_err(BulkError::Inner) }
        })
        .await
    }

    /// Like [`execute_with_retry`](Self::execute_with_retry) for attempts that can also fail
    /// with engine errors (a rate-limit wait, say). Only `BulkError::Inner` is retried or
    /// counted by the breaker.
    pub async fn execute_guarded<T, Fut, Op>(
        &self,
        ctx: &Context,
        name: &str,
        mut operation: Op,
    ) -> Result<T, BulkError<E>>
    where
        Fut: Future<Output = Result<T, BulkError<E>>>,
        Op: FnMut() -> Fut,
    {
        let breaker = self.breaker(name);
        self.policy
            .execute(ctx, || {
                let attempt = operation();
                breaker.execute(|| attempt)
            })
            .await
    }

    /// Snapshot breaker states sorted by name.
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let map = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<_> = map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Reset a breaker by name; returns false if no breaker exists under that name.
    pub fn reset(&self, name: &str) -> bool {
        let map = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        match map.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }
}
