//! Engine configuration and per-command presets.
//!
//! [`EngineConfig`] is plain data. The external CLI/config layer fills it in (with the `serde`
//! feature it deserializes directly), calls [`EngineConfig::validate`], and asks it to build the
//! runtime components.

use crate::batch::BatchOrchestrator;
use crate::classify::DEFAULT_RETRYABLE_ERRORS;
use crate::concurrency::ConcurrencyManager;
use crate::error::ConfigError;
use crate::rate_limit::{RateLimiterRegistry, DEFAULT_RATE, DEFAULT_WAIT_TIMEOUT};
use crate::retry::RetryPolicy;
use crate::retry_manager::{RetryManager, DEFAULT_MAX_FAILURES, DEFAULT_RESET_TIMEOUT};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Token bucket settings applied to every endpoint that is not configured explicitly.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RateLimitSettings {
    /// Tokens per second.
    pub rate: f64,
    /// Bucket capacity; 0 means twice the rate.
    pub burst: u32,
    pub wait_timeout: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self { rate: DEFAULT_RATE, burst: 0, wait_timeout: DEFAULT_WAIT_TIMEOUT }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub retryable_errors: Vec<String>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
            retryable_errors: DEFAULT_RETRYABLE_ERRORS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BreakerSettings {
    pub max_failures: usize,
    pub reset_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self { max_failures: DEFAULT_MAX_FAILURES, reset_timeout: DEFAULT_RESET_TIMEOUT }
    }
}

/// Everything needed to assemble the engine for one bulk command.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EngineConfig {
    /// Items per batch (the remote API's per-request cap).
    pub batch_size: usize,
    /// Batches in flight at once.
    pub concurrency: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub rate_limit: RateLimitSettings,
    pub retry: RetrySettings,
    pub breaker: BreakerSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            concurrency: 5,
            min_workers: 1,
            max_workers: 50,
            rate_limit: RateLimitSettings::default(),
            retry: RetrySettings::default(),
            breaker: BreakerSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Cache-tag purge: 100 tags per request, up to 50 workers.
    pub fn purge() -> Self {
        Self { batch_size: 100, concurrency: 10, max_workers: 50, ..Self::default() }
    }

    /// KV bulk write/delete: 10,000 pairs per request, 5 requests in flight.
    pub fn kv_bulk() -> Self {
        Self { batch_size: 10_000, concurrency: 5, max_workers: 5, ..Self::default() }
    }

    /// Per-key metadata reads: single-item requests fanned out across up to 1000 workers.
    pub fn metadata_fetch() -> Self {
        Self {
            batch_size: 1,
            concurrency: 100,
            min_workers: 10,
            max_workers: 1000,
            ..Self::default()
        }
    }

    /// Check every setting, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        if self.concurrency == 0 || self.max_workers == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        if self.breaker.max_failures == 0 {
            return Err(ConfigError::InvalidMaxFailures);
        }
        if self.breaker.reset_timeout.is_zero() {
            return Err(ConfigError::InvalidResetTimeout);
        }
        self.retry_policy::<String>().map(|_| ())
    }

    pub fn retry_policy<E>(&self) -> Result<RetryPolicy<E>, ConfigError>
    where
        E: fmt::Display + Send + Sync + 'static,
    {
        let retry = &self.retry;
        RetryPolicy::builder()
            .max_attempts(retry.max_attempts)
            .initial_delay(retry.initial_delay)
            .max_delay(retry.max_delay)
            .multiplier(retry.multiplier)
            .jitter(retry.jitter)
            .retryable_errors(retry.retryable_errors.iter().cloned())
            .build()
    }

    pub fn retry_manager<E>(&self) -> Result<RetryManager<E>, ConfigError>
    where
        E: fmt::Display + Send + Sync + 'static,
    {
        RetryManager::new(self.retry_policy()?)
            .with_breaker_settings(self.breaker.max_failures, self.breaker.reset_timeout)
    }

    /// A fresh registry using these rate-limit defaults. Usually built once per process.
    pub fn rate_limiter_registry(&self) -> RateLimiterRegistry {
        let limits = &self.rate_limit;
        RateLimiterRegistry::new(limits.rate, limits.burst, limits.wait_timeout)
    }

    pub fn concurrency_manager(&self) -> ConcurrencyManager {
        ConcurrencyManager::new(self.min_workers, self.max_workers)
    }

    /// Orchestrator with this batch size and concurrency and no rate limiter or retry attached.
    pub fn orchestrator<E>(&self) -> Result<BatchOrchestrator<E>, ConfigError>
    where
        E: fmt::Display + Send + Sync + 'static,
    {
        BatchOrchestrator::new(self.batch_size, self.concurrency)
    }

    /// Orchestrator wired to `registry` (for `endpoint`) and a retry manager named `name`.
    pub fn resilient_orchestrator<E>(
        &self,
        registry: Arc<RateLimiterRegistry>,
        endpoint: &str,
        name: &str,
    ) -> Result<BatchOrchestrator<E>, ConfigError>
    where
        E: fmt::Display + Send + Sync + 'static,
    {
        self.validate()?;
        Ok(self
            .orchestrator()?
            .with_rate_limiter(registry, endpoint)
            .with_retry(Arc::new(self.retry_manager()?), name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().unwrap();
        for preset in [EngineConfig::purge(), EngineConfig::kv_bulk(), EngineConfig::metadata_fetch()] {
            preset.validate().unwrap();
        }
    }

    #[test]
    fn presets_carry_command_limits() {
        assert_eq!(EngineConfig::purge().batch_size, 100);
        assert_eq!(EngineConfig::purge().max_workers, 50);
        assert_eq!(EngineConfig::kv_bulk().batch_size, 10_000);
        assert_eq!(EngineConfig::kv_bulk().concurrency, 5);
        assert_eq!(EngineConfig::metadata_fetch().max_workers, 1000);
    }

    #[test]
    fn validation_reports_first_problem() {
        let mut config = EngineConfig::default();
        config.batch_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidBatchSize));

        let mut config = EngineConfig::default();
        config.concurrency = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidConcurrency));

        let mut config = EngineConfig::default();
        config.retry.max_attempts = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxAttempts(0)));

        let mut config = EngineConfig::default();
        config.retry.jitter = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidJitter(_))));

        let mut config = EngineConfig::default();
        config.breaker.reset_timeout = Duration::ZERO;
        assert_eq!(config.validate(), Err(ConfigError::InvalidResetTimeout));
    }

    #[test]
    fn builds_components_from_settings() {
        let mut config = EngineConfig::purge();
        config.rate_limit.rate = 25.0;
        config.min_workers = 4;
        config.breaker.max_failures = 2;

        let registry = config.rate_limiter_registry();
        assert_eq!(registry.limiter("purge").rate(), (25.0, 50));

        let manager = config.concurrency_manager();
        assert_eq!(manager.optimal_concurrency(), 4);
        assert_eq!(manager.max_workers(), 50);

        let retry = config.retry_manager::<String>().unwrap();
        assert_eq!(retry.policy().max_attempts(), 3);

        let orchestrator = config
            .resilient_orchestrator::<String>(Arc::new(registry), "purge", "purge")
            .unwrap();
        assert_eq!(orchestrator.batch_size(), 100);
        assert_eq!(orchestrator.concurrency(), 10);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn deserializes_partial_config_over_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{ "batch_size": 500, "retry": { "max_attempts": 5 }, "rate_limit": { "rate": 4.0 } }"#,
        )
        .unwrap();
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay, Duration::from_secs(1));
        assert_eq!(config.rate_limit.rate, 4.0);
        assert_eq!(config.breaker, BreakerSettings::default());

        let round = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<EngineConfig>(&round).unwrap(), config);
    }
}
