use crate::context::Context;
use crate::error::{ContextError, RateLimitError};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Refill rate used when a non-positive rate is configured.
pub const DEFAULT_RATE: f64 = 100.0;
/// Wait budget used when the caller's context carries no deadline.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

const INITIAL_POLL: Duration = Duration::from_millis(10);
const MAX_POLL: Duration = Duration::from_secs(1);
const MIN_POLL: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }
}

/// Token bucket rate limiter.
///
/// Starts full. Tokens are tracked as `f64` so slow refill rates accumulate fractional credit;
/// the balance always stays within `[0, burst]`.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    wait_timeout: Duration,
}

fn normalize(rate: f64, burst: u32) -> (f64, f64) {
    let rate = if rate.is_finite() && rate > 0.0 { rate } else { DEFAULT_RATE };
    let burst = if burst == 0 { (rate * 2.0).ceil() } else { f64::from(burst) };
    (rate, burst)
}

impl TokenBucket {
    /// `rate` tokens per second, holding at most `burst`.
    ///
    /// Non-positive values fall back to defaults: rate 100/s, burst `2 × rate`, wait timeout 30s.
    pub fn new(rate: f64, burst: u32, wait_timeout: Duration) -> Self {
        let (rate, burst) = normalize(rate, burst);
        let wait_timeout = if wait_timeout.is_zero() { DEFAULT_WAIT_TIMEOUT } else { wait_timeout };
        Self {
            state: Mutex::new(BucketState {
                tokens: burst,
                max_tokens: burst,
                refill_rate: rate,
                last_refill: Instant::now(),
            }),
            wait_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take `n` tokens if the bucket holds that many after refilling.
    pub fn try_acquire(&self, n: u32) -> bool {
        let mut state = self.lock();
        state.refill(Instant::now());
        let cost = f64::from(n);
        if state.tokens >= cost {
            state.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Whole tokens currently available.
    pub fn available(&self) -> u32 {
        let mut state = self.lock();
        state.refill(Instant::now());
        state.tokens.floor() as u32
    }

    /// Current `(rate, burst)`.
    pub fn rate(&self) -> (f64, u32) {
        let state = self.lock();
        (state.refill_rate, state.max_tokens as u32)
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// Reconfigure at runtime. Unspent tokens carry over, capped at the new burst.
    pub fn set_rate(&self, rate: f64, burst: u32) {
        let (rate, burst) = normalize(rate, burst);
        let mut state = self.lock();
        state.refill(Instant::now());
        state.refill_rate = rate;
        state.max_tokens = burst;
        state.tokens = state.tokens.min(burst);
        tracing::debug!(rate, burst, tokens = state.tokens, "token bucket reconfigured");
    }

    // Time until `n` tokens could be available without contention.
    fn time_until(&self, n: u32) -> Duration {
        let mut state = self.lock();
        state.refill(Instant::now());
        let deficit = f64::from(n) - state.tokens;
        if deficit <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(deficit / state.refill_rate)
        }
    }

    /// Wait until `n` tokens can be taken.
    ///
    /// Polls with exponential backoff (10ms doubling to 1s, never sleeping past the moment the
    /// tokens should exist). When `ctx` has no deadline the bucket's wait timeout applies.
    /// Reaching the deadline yields [`RateLimitError::Timeout`]; cancellation yields
    /// [`RateLimitError::Context`].
    pub async fn wait(&self, ctx: &Context, n: u32) -> Result<(), RateLimitError> {
        let burst = self.rate().1;
        if n > burst {
            return Err(RateLimitError::ExceedsBurst { requested: n, burst });
        }

        let scoped = match ctx.deadline() {
            Some(_) => ctx.child(),
            None => ctx.with_timeout(self.wait_timeout),
        };
        let start = Instant::now();
        let mut poll = INITIAL_POLL;

        loop {
            if self.try_acquire(n) {
                return Ok(());
            }
            let pause = poll.min(self.time_until(n)).max(MIN_POLL);
            match scoped.sleep(pause).await {
                Ok(()) => {}
                Err(ContextError::DeadlineExceeded) => {
                    let waited = start.elapsed();
                    tracing::warn!(requested = n, ?waited, "rate limit wait timed out");
                    return Err(RateLimitError::Timeout { waited, requested: n });
                }
                Err(ContextError::Cancelled) => {
                    return Err(RateLimitError::Context(ContextError::Cancelled))
                }
            }
            poll = (poll * 2).min(MAX_POLL);
        }
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(DEFAULT_RATE, 0, DEFAULT_WAIT_TIMEOUT)
    }
}
