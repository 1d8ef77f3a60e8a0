//! Batch splitting and the batch orchestrator.
//!
//! [`BatchOrchestrator::run`] splits the input into fixed-size batches and runs up to
//! `concurrency` of them at once. Each attempt of a batch optionally waits on an endpoint's token
//! bucket and runs under a [`RetryManager`]'s retry policy and circuit breaker. A failing batch
//! never stops the others: every success and every per-batch error ends up in the
//! [`BatchReport`], and the caller decides whether partial failure is fatal.

use crate::classify::{classify, is_rate_limit_message};
use crate::concurrency::ConcurrencyManager;
use crate::context::Context;
use crate::error::{BulkError, ConfigError};
use crate::operation::Operation;
use crate::rate_limit::RateLimiterRegistry;
use crate::retry_manager::RetryManager;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, warn};

type Classifier<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
type ProgressFn = Arc<dyn Fn(usize, usize, usize) + Send + Sync>;

fn chunk<T>(items: Vec<T>, batch_size: usize) -> Vec<Vec<T>> {
    let mut batches = Vec::with_capacity(items.len().div_ceil(batch_size));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(batch_size).collect());
    }
    batches
}

/// Partition `items` into consecutive batches of at most `batch_size`, preserving order.
///
/// Empty input yields no batches; a zero batch size is rejected.
pub fn split<T>(items: Vec<T>, batch_size: usize) -> Result<Vec<Vec<T>>, ConfigError> {
    if batch_size == 0 {
        return Err(ConfigError::InvalidBatchSize);
    }
    Ok(chunk(items, batch_size))
}

/// Result of one batch.
#[derive(Debug)]
pub struct BatchOutcome<O, E> {
    pub batch_index: usize,
    pub successes: Vec<O>,
    pub error: Option<BulkError<E>>,
}

impl<O, E> BatchOutcome<O, E> {
    pub fn from_result(batch_index: usize, result: Result<Vec<O>, BulkError<E>>) -> Self {
        match result {
            Ok(successes) => Self { batch_index, successes, error: None },
            Err(error) => Self { batch_index, successes: Vec::new(), error: Some(error) },
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// A batch that ended in error.
#[derive(Debug, Clone)]
pub struct BatchFailure<E> {
    pub batch_index: usize,
    pub error: BulkError<E>,
}

/// Everything a run produced.
#[derive(Debug)]
pub struct BatchReport<O, E> {
    /// Successes from every batch, in completion order.
    pub successes: Vec<O>,
    /// Failed batches, sorted by batch index.
    pub errors: Vec<BatchFailure<E>>,
    pub total_batches: usize,
    pub total_items: usize,
}

impl<O, E: fmt::Display> BatchReport<O, E> {
    /// True when there was work and nothing succeeded.
    pub fn is_total_failure(&self) -> bool {
        self.total_items > 0 && self.successes.is_empty()
    }

    /// `"X/Y succeeded"` over input items.
    pub fn summary(&self) -> String {
        format!("{}/{} succeeded", self.successes.len(), self.total_items)
    }

    /// The first `n` batch errors, formatted for display.
    pub fn error_sample(&self, n: usize) -> Vec<String> {
        self.errors
            .iter()
            .take(n)
            .map(|failure| format!("batch {}: {}", failure.batch_index, failure.error))
            .collect()
    }
}

#[derive(Clone)]
struct RateLimit {
    registry: Arc<RateLimiterRegistry>,
    endpoint: String,
}

struct Retry<E> {
    manager: Arc<RetryManager<E>>,
    name: String,
}

impl<E> Clone for Retry<E> {
    fn clone(&self) -> Self {
        Self { manager: self.manager.clone(), name: self.name.clone() }
    }
}

/// Runs an operation over batches with bounded concurrency.
pub struct BatchOrchestrator<E> {
    batch_size: usize,
    concurrency: usize,
    rate_limit: Option<RateLimit>,
    retry: Option<Retry<E>>,
    manager: Option<Arc<ConcurrencyManager>>,
    progress: Option<ProgressFn>,
    is_rate_limit: Classifier<E>,
}

impl<E> fmt::Debug for BatchOrchestrator<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchOrchestrator")
            .field("batch_size", &self.batch_size)
            .field("concurrency", &self.concurrency)
            .field("rate_limit", &self.rate_limit.as_ref().map(|r| r.endpoint.as_str()))
            .field("retry", &self.retry.as_ref().map(|r| r.name.as_str()))
            .field("adaptive", &self.manager.is_some())
            .finish_non_exhaustive()
    }
}

struct Aggregate<O, E> {
    successes: Vec<O>,
    errors: Vec<BatchFailure<E>>,
    // A batch whose progress callback panicked is already counted.
    recorded: Vec<bool>,
    completed: usize,
}

impl<E> BatchOrchestrator<E>
where
    E: fmt::Display + Send + Sync + 'static,
{
    /// Both `batch_size` and `concurrency` must be greater than zero.
    pub fn new(batch_size: usize, concurrency: usize) -> Result<Self, ConfigError> {
        if batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        if concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        Ok(Self {
            batch_size,
            concurrency,
            rate_limit: None,
            retry: None,
            manager: None,
            progress: None,
            is_rate_limit: Arc::new(|err: &E| is_rate_limit_message(&err.to_string())),
        })
    }

    /// Take one token from `endpoint`'s bucket before every attempt.
    pub fn with_rate_limiter(
        mut self,
        registry: Arc<RateLimiterRegistry>,
        endpoint: impl Into<String>,
    ) -> Self {
        self.rate_limit = Some(RateLimit { registry, endpoint: endpoint.into() });
        self
    }

    /// Retry batches through `manager` under the breaker called `name`.
    pub fn with_retry(mut self, manager: Arc<RetryManager<E>>, name: impl Into<String>) -> Self {
        self.retry = Some(Retry { manager, name: name.into() });
        self
    }

    /// Report each attempt's latency and rate-limit signal to `manager`.
    pub fn with_concurrency_manager(mut self, manager: Arc<ConcurrencyManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Called with `(completed_batches, total_batches, success_count)` after every batch, and
    /// once with zeros when there is nothing to do. Runs on the completing task; keep it cheap.
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize, usize, usize) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn rate_limit_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.is_rate_limit = Arc::new(classifier);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run `operation` over every batch of `items`.
    ///
    /// If `ctx` finishes while batches are still waiting for a slot, those batches are reported
    /// as failed with the context error. Batches already running are not rolled back.
    pub async fn run<T, O, Op>(&self, ctx: &Context, items: Vec<T>, operation: Op) -> BatchReport<O, E>
    where
        T: Clone + Send + Sync + 'static,
        O: Send + 'static,
        Op: Operation<Vec<T>, Vec<O>, E> + 'static,
    {
        let total_items = items.len();
        let batches = chunk(items, self.batch_size);
        let total_batches = batches.len();

        let aggregate = Arc::new(Mutex::new(Aggregate {
            successes: Vec::with_capacity(total_items),
            errors: Vec::new(),
            recorded: vec![false; total_batches],
            completed: 0,
        }));

        if total_batches == 0 {
            if let Some(progress) = &self.progress {
                progress(0, 0, 0);
            }
            return BatchReport { successes: Vec::new(), errors: Vec::new(), total_batches, total_items };
        }

        let runner = Arc::new(BatchRunner {
            operation,
            rate_limit: self.rate_limit.clone(),
            retry: self.retry.clone(),
            manager: self.manager.clone(),
            is_rate_limit: self.is_rate_limit.clone(),
        });
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut spawned = HashMap::with_capacity(total_batches);

        let mut pending = batches.into_iter().enumerate();
        while let Some((index, batch)) = pending.next() {
            let permit = tokio::select! {
                biased;
                err = ctx.done() => {
                    warn!(remaining = total_batches - index, "context finished; abandoning queued batches");
                    for index in std::iter::once(index).chain(pending.by_ref().map(|(i, _)| i)) {
                        let outcome = BatchOutcome::from_result(index, Err(err.into()));
                        record(&aggregate, &self.progress, total_batches, outcome);
                    }
                    break;
                }
                permit = semaphore.clone().acquire_owned() => permit,
            };
            // The semaphore is never closed.
            let Ok(permit) = permit else { break };

            let runner = runner.clone();
            let aggregate = aggregate.clone();
            let progress = self.progress.clone();
            let ctx = ctx.clone();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                let started = Instant::now();
                let outcome = BatchOutcome::from_result(index, runner.execute(&ctx, batch).await);
                debug!(
                    batch = index,
                    ok = outcome.is_success(),
                    items = outcome.successes.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "batch finished"
                );
                if let Some(err) = &outcome.error {
                    let message = err.to_string();
                    warn!(batch = index, class = %classify(&message), error = %message, "batch failed");
                }
                record(&aggregate, &progress, total_batches, outcome);
            });
            spawned.insert(handle.id(), index);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let Err(err) = joined else { continue };
            let Some(index) = spawned.get(&err.id()).copied() else { continue };
            error!(batch = index, error = %err, "batch task failed");
            let outcome = BatchOutcome::from_result(index, Err(BulkError::Panicked(panic_message(err))));
            record(&aggregate, &self.progress, total_batches, outcome);
        }

        let Aggregate { successes, mut errors, .. } = match Arc::try_unwrap(aggregate) {
            Ok(mutex) => mutex.into_inner().unwrap_or_else(PoisonError::into_inner),
            Err(shared) => {
                let mut guard = shared.lock().unwrap_or_else(PoisonError::into_inner);
                Aggregate {
                    successes: std::mem::take(&mut guard.successes),
                    errors: std::mem::take(&mut guard.errors),
                    recorded: Vec::new(),
                    completed: guard.completed,
                }
            }
        };
        errors.sort_by_key(|failure| failure.batch_index);
        BatchReport { successes, errors, total_batches, total_items }
    }
}

fn record<O, E>(
    aggregate: &Mutex<Aggregate<O, E>>,
    progress: &Option<ProgressFn>,
    total_batches: usize,
    outcome: BatchOutcome<O, E>,
) {
    let mut state = aggregate.lock().unwrap_or_else(PoisonError::into_inner);
    match state.recorded.get_mut(outcome.batch_index) {
        Some(seen) if !*seen => *seen = true,
        _ => return,
    }
    state.successes.extend(outcome.successes);
    if let Some(error) = outcome.error {
        state.errors.push(BatchFailure { batch_index: outcome.batch_index, error });
    }
    state.completed += 1;
    // Invoked under the lock so observers see `completed` strictly increase.
    if let Some(progress) = progress {
        progress(state.completed, total_batches, state.successes.len());
    }
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => (*message).to_string(),
                Err(_) => "unknown panic payload".to_string(),
            },
        },
        Err(err) => err.to_string(),
    }
}

struct BatchRunner<Op, E> {
    operation: Op,
    rate_limit: Option<RateLimit>,
    retry: Option<Retry<E>>,
    manager: Option<Arc<ConcurrencyManager>>,
    is_rate_limit: Classifier<E>,
}

impl<Op, E> BatchRunner<Op, E>
where
    E: fmt::Display + Send + Sync + 'static,
{
    async fn execute<T, O>(&self, ctx: &Context, batch: Vec<T>) -> Result<Vec<O>, BulkError<E>>
    where
        T: Clone + Send + 'static,
        O: Send + 'static,
        Op: Operation<Vec<T>, Vec<O>, E>,
    {
        let operation = &self.operation;
        let rate_limit = self.rate_limit.as_ref();
        let manager = self.manager.as_deref();
        let is_rate_limit = &self.is_rate_limit;

        let attempt = || {
            let batch = batch.clone();
            async move {
                if let Some(limit) = rate_limit {
                    limit.registry.wait(ctx, &limit.endpoint, 1).await.map_err(BulkError::from)?;
                }
                let started = Instant::now();
                let result = operation.call(ctx.clone(), batch).await;
                if let Some(manager) = manager {
                    match &result {
                        Ok(_) => manager.record_success(started.elapsed()),
                        Err(err) => manager.record_failure(is_rate_limit(err)),
                    }
                }
                result.map_err(BulkError::Inner)
            }
        };

        match &self.retry {
            Some(retry) => retry.manager.execute_guarded(ctx, &retry.name, attempt).await,
            None => attempt().await,
        }
    }
}
