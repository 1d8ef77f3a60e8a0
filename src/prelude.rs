//! Convenient re-exports for common bulkline types.
pub use crate::{
    batch::{BatchOrchestrator, BatchReport},
    concurrency::ConcurrencyManager,
    config::EngineConfig,
    context::Context,
    error::{BulkError, ConfigError},
    operation::Operation,
    rate_limit::RateLimiterRegistry,
    retry::RetryPolicy,
    retry_manager::RetryManager,
    worker_pool::{PoolOutputs, WorkerPool},
};
