//! Named circuit breaker.
//!
//! Transitions:
//! - **Closed → Open** once consecutive failures reach `max_failures`.
//! - **Open → HalfOpen** on the first call after `reset_timeout` has elapsed since the last
//!   failure; that call becomes the probe.
//! - **HalfOpen → Closed** when the probe succeeds (failures reset to 0).
//! - **HalfOpen → Open** when the probe fails (the reset timer restarts).
//!
//! Exactly one probe is in flight while half-open; other callers are refused with
//! `BulkError::CircuitOpen` without running their operation. Only `BulkError::Inner` results
//! count as failures, so a cancelled call never trips the breaker.

use crate::clock::{Clock, MonotonicClock};
use crate::error::{BulkError, ConfigError};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast until the reset timeout elapses.
    Open,
    /// A single probe call decides whether to close or reopen.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: usize,
    last_fail_millis: u64,
    probe_in_flight: bool,
}

#[derive(Debug)]
struct Shared {
    name: String,
    max_failures: usize,
    reset_timeout: Duration,
    inner: Mutex<BreakerState>,
}

/// Circuit breaker guarding one named operation.
///
/// Clones share state, so every handle observes the same lifecycle.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
}

enum Admission {
    Normal,
    Probe,
}

// Clears the probe flag if the probe future is dropped or panics before reporting.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    /// Errors if `max_failures` is 0 or `reset_timeout` is zero.
    pub fn new(
        name: impl Into<String>,
        max_failures: usize,
        reset_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if max_failures == 0 {
            return Err(ConfigError::InvalidMaxFailures);
        }
        if reset_timeout.is_zero() {
            return Err(ConfigError::InvalidResetTimeout);
        }
        Ok(Self::with_validated(name.into(), max_failures, reset_timeout))
    }

    // Callers must have checked `max_failures > 0` and a non-zero timeout.
    pub(crate) fn with_validated(name: String, max_failures: usize, reset_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                max_failures,
                reset_timeout,
                inner: Mutex::new(BreakerState {
                    state: CircuitState::Closed,
                    failures: 0,
                    last_fail_millis: 0,
                    probe_in_flight: false,
                }),
            }),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive failures recorded since the last success.
    pub fn failures(&self) -> usize {
        self.lock().failures
    }

    /// Force the breaker back to Closed with no recorded failures.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.state = CircuitState::Closed;
        state.failures = 0;
        state.probe_in_flight = false;
        tracing::info!(breaker = %self.shared.name, "circuit breaker reset");
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_error<E>(&self, state: &BreakerState, now: u64) -> BulkError<E> {
        BulkError::CircuitOpen {
            name: self.shared.name.clone(),
            failure_count: state.failures,
            open_for: Duration::from_millis(now.saturating_sub(state.last_fail_millis)),
        }
    }

    fn admit<E>(&self) -> Result<Admission, BulkError<E>> {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let elapsed = now.saturating_sub(state.last_fail_millis);
                if u128::from(elapsed) > self.shared.reset_timeout.as_millis() {
                    state.state = CircuitState::HalfOpen;
                    state.probe_in_flight = true;
                    tracing::info!(breaker = %self.shared.name, "circuit breaker → half-open");
                    Ok(Admission::Probe)
                } else {
                    Err(self.open_error(&state, now))
                }
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    Err(self.open_error(&state, now))
                } else {
                    state.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    /// Run `operation` under breaker protection.
    ///
    /// Returns `BulkError::CircuitOpen` without invoking `operation` while the circuit is open
    /// or a half-open probe is already running.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, BulkError<E>>
    where
        Fut: Future<Output = Result<T, BulkError<E>>>,
        Op: FnOnce() -> Fut,
    {
        let probe = matches!(self.admit::<E>()?, Admission::Probe);
        let mut guard = ProbeGuard { breaker: self, armed: probe };

        let result = operation().await;

        guard.armed = false;
        drop(guard);
        match &result {
            Ok(_) => self.on_success(probe),
            Err(BulkError::Inner(_)) => self.on_failure(probe),
            // Cancelled or otherwise interrupted: the next caller may probe instead.
            Err(_) if probe => self.lock().probe_in_flight = false,
            Err(_) => {}
        }
        result
    }

    fn on_success(&self, probe: bool) {
        let mut state = self.lock();
        if probe {
            state.probe_in_flight = false;
        }
        match state.state {
            CircuitState::HalfOpen if probe => {
                state.state = CircuitState::Closed;
                state.failures = 0;
                tracing::info!(breaker = %self.shared.name, "circuit breaker → closed");
            }
            CircuitState::Closed => state.failures = 0,
            _ => {}
        }
    }

    fn on_failure(&self, probe: bool) {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        if probe {
            state.probe_in_flight = false;
        }
        state.failures += 1;
        state.last_fail_millis = now;
        let failures = state.failures;
        match state.state {
            CircuitState::HalfOpen if probe => {
                state.state = CircuitState::Open;
                tracing::warn!(breaker = %self.shared.name, failures, "circuit breaker probe failed → open");
            }
            CircuitState::Closed if failures >= self.shared.max_failures => {
                state.state = CircuitState::Open;
                tracing::error!(
                    breaker = %self.shared.name,
                    failures,
                    threshold = self.shared.max_failures,
                    "circuit breaker → open"
                );
            }
            _ => {}
        }
    }
}
