//! Rate limiting primitives.
//!
//! - [`TokenBucket`]: a single token bucket; refills continuously at `rate` tokens per second up
//!   to `burst`, and callers spend tokens before issuing a request.
//! - [`RateLimiterRegistry`]: one bucket per logical endpoint, created lazily on first use.
//!
//! The registry is an ordinary value. Construct it once per application and share it (usually
//! behind an `Arc`) with every batch run that talks to the same API, so limits hold across
//! concurrent bulk commands.

pub mod bucket;
pub mod registry;

pub use bucket::{TokenBucket, DEFAULT_RATE, DEFAULT_WAIT_TIMEOUT};
pub use registry::RateLimiterRegistry;
