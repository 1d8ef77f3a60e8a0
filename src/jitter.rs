//! Proportional jitter for retry delays.
//!
//! A jitter of `0.1` perturbs each delay uniformly within `±10%`, spreading retries from many
//! workers that failed at the same moment. Uses `rand`'s thread-local RNG by default;
//! deterministic RNGs can be injected through [`Jitter::apply_with_rng`].

use crate::error::ConfigError;
use rand::{rng, Rng};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Jitter {
    fraction: f64,
}

impl Jitter {
    /// Jitter of `±fraction × delay`; `fraction` must lie in `[0.0, 1.0]`.
    pub fn new(fraction: f64) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(ConfigError::InvalidJitter(fraction.to_string()));
        }
        Ok(Self { fraction })
    }

    /// Exact delays.
    pub fn none() -> Self {
        Self { fraction: 0.0 }
    }

    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rng())
    }

    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        if self.fraction == 0.0 || delay.is_zero() {
            return delay;
        }
        let nanos = delay.as_nanos() as f64;
        let spread = nanos * self.fraction;
        let offset = rng.random_range(-spread..=spread);
        Duration::from_nanos((nanos + offset).max(0.0).round() as u64)
    }
}

impl Default for Jitter {
    /// `±10%`.
    fn default() -> Self {
        Self { fraction: 0.1 }
    }
}
