//! Adaptive pool of workers draining a bounded queue.
//!
//! Workers pull items from a queue of capacity `2 × max_workers`, run the [`Operation`], report
//! the outcome to the [`ConcurrencyManager`] and push it onto the result or error queue (each of
//! capacity `max_workers`, so a slow consumer applies backpressure).
//!
//! The pool grows toward the manager's target whenever [`WorkerPool::adjust_workers`] runs (at
//! construction and on every monitor tick) and never above `max_workers`. Running operations are
//! never interrupted: when the target drops, surplus workers retire after their current item.
//!
//! Must be built inside a Tokio runtime.

use crate::classify::is_rate_limit_message;
use crate::concurrency::ConcurrencyManager;
use crate::context::Context;
use crate::operation::Operation;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// How often the monitor re-reads the concurrency target.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5);

type Classifier<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Receiving ends of the pool's output queues.
///
/// Both close once the pool has shut down and every worker has exited.
#[derive(Debug)]
pub struct PoolOutputs<O, E> {
    pub results: mpsc::Receiver<O>,
    pub errors: mpsc::Receiver<E>,
}

/// Why [`WorkerPool::submit`] handed the item back.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError<I> {
    #[error("worker pool is closed")]
    Closed(I),
    #[error("context canceled")]
    Cancelled(I),
}

impl<I> SubmitError<I> {
    pub fn into_item(self) -> I {
        match self {
            SubmitError::Closed(item) | SubmitError::Cancelled(item) => item,
        }
    }
}

struct OutputSenders<O, E> {
    results: mpsc::Sender<O>,
    errors: mpsc::Sender<E>,
}

struct Shared<I, O, E> {
    ctx: Context,
    manager: Arc<ConcurrencyManager>,
    operation: Arc<dyn Operation<I, O, E>>,
    is_rate_limit: Classifier<E>,
    queue: tokio::sync::Mutex<mpsc::Receiver<I>>,
    // `None` once shutdown begins; no worker is spawned after that.
    outputs: Mutex<Option<OutputSenders<O, E>>>,
    workers: Mutex<JoinSet<()>>,
    active: AtomicUsize,
    next_id: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<I, O, E> Shared<I, O, E>
where
    I: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
{
    fn spawn_up_to_target(self: &Arc<Self>) -> usize {
        if self.ctx.is_cancelled() {
            return 0;
        }
        let outputs = lock(&self.outputs);
        let Some(senders) = outputs.as_ref() else {
            return 0;
        };
        let target = self.manager.optimal_concurrency().min(self.manager.max_workers());

        let mut workers = lock(&self.workers);
        reap(&mut workers);
        let mut spawned = 0;
        while self.active.load(Ordering::Acquire) < target {
            self.active.fetch_add(1, Ordering::AcqRel);
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let worker = Worker {
                id,
                shared: Arc::clone(self),
                results: senders.results.clone(),
                errors: senders.errors.clone(),
            };
            workers.spawn(worker.run());
            spawned += 1;
        }
        if spawned > 0 {
            debug!(spawned, target, active = self.active.load(Ordering::Acquire), "workers spawned");
        }
        spawned
    }

    // Give up this worker's slot if the pool is above target.
    fn try_retire(&self) -> bool {
        let target = self.manager.optimal_concurrency();
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active > target).then(|| active - 1)
            })
            .is_ok()
    }
}

// Collect workers that already exited so the set stays bounded across retire/respawn cycles.
fn reap(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.try_join_next() {
        if let Err(err) = joined {
            if err.is_panic() {
                warn!(error = %err, "worker panicked");
            }
        }
    }
}

// A live worker's claim on `active`. Released on every exit path, including unwinding.
struct Slot<I, O, E>
where
    I: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
{
    shared: Arc<Shared<I, O, E>>,
    held: bool,
}

impl<I, O, E> Drop for Slot<I, O, E>
where
    I: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
{
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        self.shared.active.fetch_sub(1, Ordering::AcqRel);
        if std::thread::panicking() {
            warn!("operation panicked; replacing worker");
            self.shared.spawn_up_to_target();
        }
    }
}

struct Worker<I, O, E> {
    id: usize,
    shared: Arc<Shared<I, O, E>>,
    results: mpsc::Sender<O>,
    errors: mpsc::Sender<E>,
}

impl<I, O, E> Worker<I, O, E>
where
    I: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
{
    async fn run(self) {
        let shared = &self.shared;
        let mut slot = Slot { shared: Arc::clone(shared), held: true };
        trace!(worker = self.id, "worker started");
        loop {
            if shared.try_retire() {
                slot.held = false;
                trace!(worker = self.id, "worker retired above target");
                return;
            }

            let next = tokio::select! {
                biased;
                _ = shared.ctx.done() => None,
                item = async { shared.queue.lock().await.recv().await } => item,
            };
            let Some(item) = next else { break };

            let started = Instant::now();
            let outcome = shared.operation.call(shared.ctx.clone(), item).await;
            let latency = started.elapsed();

            let delivered = match outcome {
                Ok(value) => {
                    shared.manager.record_success(latency);
                    tokio::select! {
                        biased;
                        _ = shared.ctx.done() => false,
                        _ = self.results.send(value) => true,
                    }
                }
                Err(err) => {
                    shared.manager.record_failure((shared.is_rate_limit)(&err));
                    tokio::select! {
                        biased;
                        _ = shared.ctx.done() => false,
                        _ = self.errors.send(err) => true,
                    }
                }
            };
            if !delivered {
                break;
            }
        }
        drop(slot);
        trace!(worker = self.id, "worker exited");
    }
}

/// Pool of workers running one [`Operation`] over submitted items.
pub struct WorkerPool<I, O, E> {
    shared: Arc<Shared<I, O, E>>,
    sender: Mutex<Option<mpsc::Sender<I>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    monitor_stop: CancellationToken,
}

impl<I, O, E> fmt::Debug for WorkerPool<I, O, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("active", &self.shared.active.load(Ordering::Relaxed))
            .field("target", &self.shared.manager.optimal_concurrency())
            .field("max_workers", &self.shared.manager.max_workers())
            .finish_non_exhaustive()
    }
}

impl<I, O, E> WorkerPool<I, O, E>
where
    I: Send + 'static,
    O: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    pub fn builder<Op>(operation: Op, manager: Arc<ConcurrencyManager>) -> WorkerPoolBuilder<I, O, E>
    where
        Op: Operation<I, O, E> + 'static,
    {
        WorkerPoolBuilder::new(operation, manager)
    }
}

impl<I, O, E> WorkerPool<I, O, E>
where
    I: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
{
    /// Spawn workers until the live count reaches the current target. Returns how many started.
    pub fn adjust_workers(&self) -> usize {
        self.shared.spawn_up_to_target()
    }

    /// Workers currently alive.
    pub fn active_workers(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// The pool's own context; cancelling it stops every worker.
    pub fn context(&self) -> &Context {
        &self.shared.ctx
    }

    /// Queue `item`, waiting for space when the queue is full.
    ///
    /// The item is handed back if the pool is closed or its context finishes first.
    pub async fn submit(&self, item: I) -> Result<(), SubmitError<I>> {
        let sender = match lock(&self.sender).as_ref() {
            Some(sender) => sender.clone(),
            None => return Err(SubmitError::Closed(item)),
        };
        let permit = tokio::select! {
            biased;
            _ = self.shared.ctx.done() => return Err(SubmitError::Cancelled(item)),
            permit = sender.reserve() => permit,
        };
        match permit {
            Ok(permit) => {
                permit.send(item);
                Ok(())
            }
            Err(_) => Err(SubmitError::Closed(item)),
        }
    }

    /// Stop accepting items, let workers drain the queue, then close the output queues.
    ///
    /// Outputs must be consumed concurrently or workers block on full queues.
    pub async fn shutdown(&self) {
        lock(&self.sender).take();
        self.monitor_stop.cancel();
        let monitor = lock(&self.monitor).take();
        if let Some(handle) = monitor {
            let _ = handle.await;
        }
        lock(&self.shared.outputs).take();

        let mut workers = std::mem::take(&mut *lock(&self.shared.workers));
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                if err.is_panic() {
                    warn!(error = %err, "worker panicked");
                }
            }
        }
        debug!("worker pool shut down");
    }

    /// Cancel the pool's context, then shut down. Queued items are abandoned.
    pub async fn close(&self) {
        self.shared.ctx.cancel();
        self.shutdown().await;
    }
}

impl<I, O, E> Drop for WorkerPool<I, O, E> {
    fn drop(&mut self) {
        self.monitor_stop.cancel();
    }
}

fn spawn_monitor<I, O, E>(
    shared: Weak<Shared<I, O, E>>,
    stop: CancellationToken,
    period: Duration,
) -> JoinHandle<()>
where
    I: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(shared) = shared.upgrade() else { break };
                    if shared.ctx.is_cancelled() {
                        break;
                    }
                    shared.spawn_up_to_target();
                }
            }
        }
        trace!("worker pool monitor stopped");
    })
}

/// Builder for [`WorkerPool`].
pub struct WorkerPoolBuilder<I, O, E> {
    operation: Arc<dyn Operation<I, O, E>>,
    manager: Arc<ConcurrencyManager>,
    ctx: Context,
    monitor_interval: Duration,
    is_rate_limit: Classifier<E>,
}

impl<I, O, E> WorkerPoolBuilder<I, O, E>
where
    I: Send + 'static,
    O: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    pub fn new<Op>(operation: Op, manager: Arc<ConcurrencyManager>) -> Self
    where
        Op: Operation<I, O, E> + 'static,
    {
        Self {
            operation: Arc::new(operation),
            manager,
            ctx: Context::new(),
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            is_rate_limit: Arc::new(|err: &E| is_rate_limit_message(&err.to_string())),
        }
    }

    /// Parent context. The pool derives its own child, so closing the pool leaves this one live.
    pub fn context(mut self, ctx: &Context) -> Self {
        self.ctx = ctx.clone();
        self
    }

    pub fn monitor_interval(mut self, period: Duration) -> Self {
        if !period.is_zero() {
            self.monitor_interval = period;
        }
        self
    }

    /// Decide which operation errors count as rate limiting. Defaults to message inspection.
    pub fn rate_limit_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.is_rate_limit = Arc::new(classifier);
        self
    }

    /// Start the pool and its monitor.
    pub fn build(self) -> (WorkerPool<I, O, E>, PoolOutputs<O, E>) {
        let max_workers = self.manager.max_workers();
        let (work_tx, work_rx) = mpsc::channel(max_workers.saturating_mul(2));
        let (results_tx, results_rx) = mpsc::channel(max_workers);
        let (errors_tx, errors_rx) = mpsc::channel(max_workers);

        let shared = Arc::new(Shared {
            ctx: self.ctx.child(),
            manager: self.manager,
            operation: self.operation,
            is_rate_limit: self.is_rate_limit,
            queue: tokio::sync::Mutex::new(work_rx),
            outputs: Mutex::new(Some(OutputSenders { results: results_tx, errors: errors_tx })),
            workers: Mutex::new(JoinSet::new()),
            active: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
        });
        shared.spawn_up_to_target();

        let monitor_stop = shared.ctx.token().child_token();
        let monitor =
            spawn_monitor(Arc::downgrade(&shared), monitor_stop.clone(), self.monitor_interval);

        let pool = WorkerPool {
            shared,
            sender: Mutex::new(Some(work_tx)),
            monitor: Mutex::new(Some(monitor)),
            monitor_stop,
        };
        (pool, PoolOutputs { results: results_rx, errors: errors_rx })
    }
}
