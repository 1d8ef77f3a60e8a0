//! Adaptive concurrency target.
//!
//! [`ConcurrencyManager`] keeps windowed success/latency counters and periodically moves the
//! worker target within `[min, max]`:
//!
//! | condition (checked in order)                 | factor |
//! |----------------------------------------------|--------|
//! | any rate-limit hit in the window             | ×0.7   |
//! | success rate > 0.95 and avg latency < 500ms  | ×1.2   |
//! | success rate < 0.90 or avg latency > 2000ms  | ×0.9   |
//!
//! An adjustment runs at most once per 10s and only after 100 samples; the window counters
//! reset when it does. A rate-limited failure additionally halves the target on the spot.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Minimum time between two periodic adjustments.
pub const ADJUST_PERIOD: Duration = Duration::from_secs(10);
/// Samples required in the window before an adjustment is considered.
pub const MIN_SAMPLES: u64 = 100;

const RATE_LIMIT_CUT: f64 = 0.5;
const RATE_LIMIT_WINDOW_FACTOR: f64 = 0.7;
const INCREASE_FACTOR: f64 = 1.2;
const DECREASE_FACTOR: f64 = 0.9;
const HEALTHY_SUCCESS_RATE: f64 = 0.95;
const UNHEALTHY_SUCCESS_RATE: f64 = 0.90;
const FAST_LATENCY: Duration = Duration::from_millis(500);
const SLOW_LATENCY: Duration = Duration::from_millis(2000);

/// Point-in-time view of a [`ConcurrencyManager`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConcurrencySnapshot {
    pub target: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub rate_limit_hits: u64,
    pub avg_latency: Duration,
    pub last_latency: Duration,
}

impl ConcurrencySnapshot {
    /// Successes over total requests in the current window; 1.0 for an empty window.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful as f64 / self.total_requests as f64
        }
    }
}

#[derive(Debug)]
pub struct ConcurrencyManager {
    min_workers: usize,
    max_workers: usize,
    target: AtomicUsize,
    total_requests: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    rate_limit_hits: AtomicU64,
    avg_latency_nanos: AtomicU64,
    last_latency_nanos: AtomicU64,
    last_adjust: Mutex<Instant>,
}

fn scale(current: usize, factor: f64) -> usize {
    (current as f64 * factor).floor() as usize
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

impl ConcurrencyManager {
    /// `min_workers` below 1 becomes 1; `max_workers` below the minimum becomes `min × 10`.
    /// The target starts at the minimum.
    pub fn new(min_workers: usize, max_workers: usize) -> Self {
        let min_workers = min_workers.max(1);
        let max_workers = if max_workers < min_workers {
            min_workers.saturating_mul(10)
        } else {
            max_workers
        };
        Self {
            min_workers,
            max_workers,
            target: AtomicUsize::new(min_workers),
            total_requests: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rate_limit_hits: AtomicU64::new(0),
            avg_latency_nanos: AtomicU64::new(0),
            last_latency_nanos: AtomicU64::new(0),
            last_adjust: Mutex::new(Instant::now()),
        }
    }

    pub fn min_workers(&self) -> usize {
        self.min_workers
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Current worker target.
    pub fn optimal_concurrency(&self) -> usize {
        self.target.load(Ordering::Acquire)
    }

    /// Override the target, clamped to `[min, max]`.
    pub fn set_target(&self, target: usize) {
        let clamped = target.clamp(self.min_workers, self.max_workers);
        self.target.store(clamped, Ordering::Release);
    }

    pub fn record_success(&self, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::AcqRel);
        self.successful.fetch_add(1, Ordering::AcqRel);

        let sample = nanos(latency);
        self.last_latency_nanos.store(sample, Ordering::Release);
        // Seeded with the first sample, then 9 parts history to 1 part new.
        let _ = self.avg_latency_nanos.fetch_update(Ordering::AcqRel, Ordering::Acquire, |avg| {
            Some(if avg == 0 { sample } else { ((u128::from(avg) * 9 + u128::from(sample)) / 10) as u64 })
        });

        self.adjust();
    }

    /// Record a failed operation. Rate-limited failures cut the target in half immediately.
    pub fn record_failure(&self, is_rate_limit: bool) {
        self.total_requests.fetch_add(1, Ordering::AcqRel);
        self.failed.fetch_add(1, Ordering::AcqRel);

        if is_rate_limit {
            self.rate_limit_hits.fetch_add(1, Ordering::AcqRel);
            let min = self.min_workers;
            if let Ok(previous) = self.target.fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                Some(scale(t, RATE_LIMIT_CUT).max(min))
            }) {
                warn!(
                    from = previous,
                    to = self.optimal_concurrency(),
                    "rate limited; cutting concurrency"
                );
            }
        }

        self.adjust();
    }

    pub fn snapshot(&self) -> ConcurrencySnapshot {
        ConcurrencySnapshot {
            target: self.optimal_concurrency(),
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            total_requests: self.total_requests.load(Ordering::Acquire),
            successful: self.successful.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Acquire),
            avg_latency: Duration::from_nanos(self.avg_latency_nanos.load(Ordering::Acquire)),
            last_latency: Duration::from_nanos(self.last_latency_nanos.load(Ordering::Acquire)),
        }
    }

    fn adjust(&self) {
        if self.total_requests.load(Ordering::Acquire) < MIN_SAMPLES {
            return;
        }
        let mut last_adjust = self.last_adjust.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if now.saturating_duration_since(*last_adjust) < ADJUST_PERIOD {
            return;
        }

        let window = self.snapshot();
        // Another caller may have adjusted and reset the window while we waited for the lock.
        if window.total_requests < MIN_SAMPLES {
            return;
        }
        let success_rate = window.success_rate();
        let (min, max) = (self.min_workers, self.max_workers);

        let (reason, factor) = if window.rate_limit_hits > 0 {
            ("rate_limited", RATE_LIMIT_WINDOW_FACTOR)
        } else if success_rate > HEALTHY_SUCCESS_RATE && window.avg_latency < FAST_LATENCY {
            ("healthy", INCREASE_FACTOR)
        } else if success_rate < UNHEALTHY_SUCCESS_RATE || window.avg_latency > SLOW_LATENCY {
            ("degraded", DECREASE_FACTOR)
        } else {
            ("steady", 1.0)
        };

        let previous = self
            .target
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = if factor > 1.0 {
                    scale(current, factor).max(current + 1)
                } else {
                    scale(current, factor)
                };
                Some(next.clamp(min, max))
            })
            .unwrap_or_else(|current| current);
        let target = self.optimal_concurrency();

        if previous != target {
            info!(
                from = previous,
                to = target,
                reason,
                success_rate,
                avg_latency_ms = window.avg_latency.as_millis() as u64,
                samples = window.total_requests,
                "concurrency adjusted"
            );
        }

        self.total_requests.store(0, Ordering::Release);
        self.successful.store(0, Ordering::Release);
        self.failed.store(0, Ordering::Release);
        self.rate_limit_hits.store(0, Ordering::Release);
        *last_adjust = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn successes(manager: &ConcurrencyManager, n: usize, latency: Duration) {
        for _ in 0..n {
            manager.record_success(latency);
        }
    }

    #[test]
    fn new_normalizes_bounds() {
        let m = ConcurrencyManager::new(0, 0);
        assert_eq!((m.min_workers(), m.max_workers()), (1, 10));
        assert_eq!(m.optimal_concurrency(), 1);

        let m = ConcurrencyManager::new(5, 2);
        assert_eq!((m.min_workers(), m.max_workers()), (5, 50));
        assert_eq!(m.optimal_concurrency(), 5);
    }

    #[test]
    fn set_target_clamps() {
        let m = ConcurrencyManager::new(2, 20);
        m.set_target(100);
        assert_eq!(m.optimal_concurrency(), 20);
        m.set_target(0);
        assert_eq!(m.optimal_concurrency(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_failure_halves_immediately() {
        let m = ConcurrencyManager::new(2, 20);
        m.set_target(10);
        m.record_failure(true);
        assert_eq!(m.optimal_concurrency(), 5);
        m.record_failure(true);
        assert_eq!(m.optimal_concurrency(), 2);
        m.record_failure(true);
        assert_eq!(m.optimal_concurrency(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn plain_failure_does_not_cut() {
        let m = ConcurrencyManager::new(2, 20);
        m.set_target(10);
        m.record_failure(false);
        assert_eq!(m.optimal_concurrency(), 10);
        assert_eq!(m.snapshot().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_adjustment_before_period_elapses() {
        let m = ConcurrencyManager::new(1, 50);
        m.set_target(10);
        successes(&m, 500, Duration::from_millis(10));
        assert_eq!(m.optimal_concurrency(), 10);
        assert_eq!(m.snapshot().total_requests, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn no_adjustment_below_sample_floor() {
        let m = ConcurrencyManager::new(1, 50);
        m.set_target(10);
        tokio::time::advance(Duration::from_secs(60)).await;
        successes(&m, 99, Duration::from_millis(10));
        assert_eq!(m.optimal_concurrency(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_window_increases_and_resets_counters() {
        let m = ConcurrencyManager::new(1, 50);
        m.set_target(10);
        tokio::time::advance(ADJUST_PERIOD).await;
        successes(&m, 100, Duration::from_millis(50));
        assert_eq!(m.optimal_concurrency(), 12);
        assert_eq!(m.snapshot().total_requests, 0);

        // The period restarts from the adjustment.
        successes(&m, 100, Duration::from_millis(50));
        assert_eq!(m.optimal_concurrency(), 12);
        tokio::time::advance(ADJUST_PERIOD).await;
        m.record_success(Duration::from_millis(50));
        assert_eq!(m.optimal_concurrency(), 14);
    }

    #[tokio::test(start_paused = true)]
    async fn increase_adds_at_least_one_and_caps_at_max() {
        let m = ConcurrencyManager::new(1, 3);
        m.set_target(2);
        tokio::time::advance(ADJUST_PERIOD).await;
        successes(&m, 100, Duration::from_millis(1));
        assert_eq!(m.optimal_concurrency(), 3);

        tokio::time::advance(ADJUST_PERIOD).await;
        successes(&m, 100, Duration::from_millis(1));
        assert_eq!(m.optimal_concurrency(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn low_success_rate_decreases() {
        let m = ConcurrencyManager::new(1, 50);
        m.set_target(20);
        tokio::time::advance(ADJUST_PERIOD).await;
        for _ in 0..20 {
            m.record_failure(false);
        }
        successes(&m, 80, Duration::from_millis(10));
        assert_eq!(m.optimal_concurrency(), 18);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_latency_decreases_even_when_successful() {
        let m = ConcurrencyManager::new(1, 50);
        m.set_target(10);
        tokio::time::advance(ADJUST_PERIOD).await;
        successes(&m, 100, Duration::from_secs(3));
        assert_eq!(m.optimal_concurrency(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_in_window_takes_precedence() {
        let m = ConcurrencyManager::new(1, 50);
        m.set_target(20);
        tokio::time::advance(ADJUST_PERIOD).await;
        successes(&m, 99, Duration::from_millis(10));
        m.record_failure(true);
        // Halved to 10 on the spot, then the window adjustment applies ×0.7.
        assert_eq!(m.optimal_concurrency(), 7);
        assert_eq!(m.snapshot().rate_limit_hits, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn middling_window_leaves_target_unchanged() {
        let m = ConcurrencyManager::new(1, 50);
        m.set_target(10);
        tokio::time::advance(ADJUST_PERIOD).await;
        for _ in 0..8 {
            m.record_failure(false);
        }
        successes(&m, 92, Duration::from_millis(10));
        assert_eq!(m.optimal_concurrency(), 10);
        assert_eq!(m.snapshot().total_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn latency_ema_is_seeded_then_weighted() {
        let m = ConcurrencyManager::new(1, 10);
        m.record_success(Duration::from_millis(100));
        assert_eq!(m.snapshot().avg_latency, Duration::from_millis(100));
        m.record_success(Duration::from_millis(200));
        let snap = m.snapshot();
        assert_eq!(snap.avg_latency, Duration::from_millis(110));
        assert_eq!(snap.last_latency, Duration::from_millis(200));
    }

    #[test]
    fn success_rate_of_empty_window_is_one() {
        let m = ConcurrencyManager::new(1, 10);
        assert_eq!(m.snapshot().success_rate(), 1.0);
    }
}
