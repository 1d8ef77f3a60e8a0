#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # bulkline
//!
//! Resilient, adaptively-concurrent batch execution for bulk operations against a rate-limited
//! remote API (purging thousands of cache tags, writing or deleting thousands of key-value
//! pairs).
//!
//! ## Features
//!
//! - **Token buckets** per endpoint, held by an injectable [`RateLimiterRegistry`]
//! - **Retry policies** with exponential backoff, jitter and message-based classification
//! - **Circuit breakers** per operation name with a single half-open probe
//! - **Adaptive concurrency** driven by success rate and latency
//! - **Worker pool** that grows toward the adaptive target and retires surplus workers
//! - **Batch orchestrator** that splits input, bounds concurrency and aggregates results
//!
//! Every wait (rate limiter, backoff, queue send, semaphore) is governed by a [`Context`];
//! cancelling it unblocks all of them.
//!
//! ## Quick Start
//!
//! ```rust
//! use bulkline::{BatchOrchestrator, Context, EngineConfig, RateLimiterRegistry};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::purge();
//!     let registry = Arc::new(config.rate_limiter_registry());
//!     let orchestrator: BatchOrchestrator<String> =
//!         config.resilient_orchestrator(registry, "zones/purge_cache", "purge")?;
//!
//!     let tags: Vec<String> = (0..250).map(|i| format!("tag-{i}")).collect();
//!     let purge = |_ctx: Context, batch: Vec<String>| async move {
//!         // issue the HTTP request for `batch` here
//!         Ok::<_, String>(batch)
//!     };
//!
//!     let report = orchestrator.run(&Context::new(), tags, purge).await;
//!     println!("{}", report.summary());
//!     assert_eq!(report.successes.len(), 250);
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod batch;
pub mod circuit_breaker;
pub mod classify;
pub mod clock;
pub mod concurrency;
pub mod config;
pub mod context;
pub mod error;
pub mod jitter;
pub mod operation;
pub mod prelude;
pub mod rate_limit;
pub mod retry;
pub mod retry_manager;
pub mod sleeper;
pub mod worker_pool;

// Re-exports
pub use backoff::Backoff;
pub use batch::{split, BatchFailure, BatchOrchestrator, BatchOutcome, BatchReport};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use classify::{classify, is_rate_limit_message, ErrorClass};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use concurrency::{ConcurrencyManager, ConcurrencySnapshot};
pub use config::{BreakerSettings, EngineConfig, RateLimitSettings, RetrySettings};
pub use context::Context;
pub use error::{BulkError, ConfigError, ContextError, RateLimitError};
pub use jitter::Jitter;
pub use operation::Operation;
pub use rate_limit::{RateLimiterRegistry, TokenBucket};
pub use retry::{retry, RetryPolicy, RetryPolicyBuilder};
pub use retry_manager::RetryManager;
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use worker_pool::{PoolOutputs, SubmitError, WorkerPool, WorkerPoolBuilder};
