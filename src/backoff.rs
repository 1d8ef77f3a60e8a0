//! Exponential backoff for retry delays.
//!
//! Attempt semantics follow the retry loop: attempt `n` is the `n`th failed call (1-based), and
//! the delay before the next call is `initial × multiplier^(n−1)`, capped at `max`. Attempt `0`
//! stands for "no failure yet" and yields no delay.
//!
//! ```rust
//! use std::time::Duration;
//! use bulkline::Backoff;
//!
//! let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 2.0).unwrap();
//! assert_eq!(backoff.delay(1), Duration::from_secs(1));
//! assert_eq!(backoff.delay(3), Duration::from_secs(4));
//! assert_eq!(backoff.delay(10), Duration::from_secs(30)); // capped
//! ```
//!
//! Computations that overflow saturate to `MAX_BACKOFF` (1 day).

use crate::error::ConfigError;
use std::time::Duration;

/// Ceiling applied when a computed delay overflows.
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    /// Validated constructor: `max >= initial`, `multiplier` finite and `>= 1.0`.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Result<Self, ConfigError> {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier(multiplier.to_string()));
        }
        if max < initial {
            return Err(ConfigError::MaxDelayBelowInitial { initial, max });
        }
        Ok(Self { initial, max, multiplier })
    }

    /// Same delay before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { initial: delay, max: delay, multiplier: 1.0 }
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Delay to wait after failed attempt `attempt` (1-based).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let factor = self.multiplier.powi(exponent);
        let nanos = self.initial.as_nanos() as f64 * factor;
        let raw = if nanos.is_finite() && nanos < MAX_BACKOFF.as_nanos() as f64 {
            Duration::from_nanos(nanos.round() as u64)
        } else {
            MAX_BACKOFF
        };
        raw.min(self.max).min(MAX_BACKOFF)
    }
}

impl Default for Backoff {
    /// 1s initial, 30s cap, doubling.
    fn default() -> Self {
        Self { initial: Duration::from_secs(1), max: Duration::from_secs(30), multiplier: 2.0 }
    }
}
