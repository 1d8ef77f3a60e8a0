//! Error classification by message inspection.
//!
//! The remote API surfaces failures as text (`"HTTP 429: Too Many Requests"`, `"dial tcp:
//! connection refused"`), so the default classifiers are case-insensitive substring matches.
//! Callers with structured errors can bypass this entirely through
//! [`RetryPolicyBuilder::should_retry`](crate::RetryPolicyBuilder::should_retry) and
//! [`WorkerPoolBuilder::rate_limit_classifier`](crate::WorkerPoolBuilder::rate_limit_classifier).
//!
//! The engine's defaults match against the configurable substring lists. [`classify`] is the
//! coarser taxonomy: the orchestrator tags failed batches with it in its logs, and callers can
//! plug it into a retry policy in place of the substring list:
//!
//! ```rust
//! use bulkline::{classify, RetryPolicy};
//!
//! let policy = RetryPolicy::<String>::builder()
//!     .should_retry(|err: &String| classify(err).is_retryable())
//!     .build()
//!     .unwrap();
//! assert_eq!(policy.max_attempts(), 3);
//! ```

use std::fmt;

/// Substrings that mark an error as retryable by default.
pub const DEFAULT_RETRYABLE_ERRORS: &[&str] = &[
    "429",
    "500",
    "502",
    "503",
    "504",
    "timeout",
    "connection refused",
    "connection reset",
    "eof",
    "context deadline exceeded",
    "too many requests",
    "rate limit",
];

/// Substrings that mark an error as a rate-limit response.
pub const RATE_LIMIT_MARKERS: &[&str] = &["429", "rate limit", "too many requests"];

const CANCELLED_MARKERS: &[&str] = &["context canceled", "context cancelled"];
const SERVER_MARKERS: &[&str] = &[
    "500",
    "502",
    "503",
    "504",
    "internal server error",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
];
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "broken pipe",
    "eof",
    "context deadline exceeded",
];

/// Broad failure categories the engine reacts to differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Cancellation of the caller's context. Terminal, propagated verbatim.
    Cancelled,
    /// HTTP 429 or equivalent. Retryable, and cuts concurrency immediately.
    RateLimit,
    /// 5xx responses. Retryable.
    Server,
    /// Timeouts, refused or reset connections, truncated responses. Retryable.
    Transient,
    /// 4xx responses other than 429. Terminal.
    Client,
    /// Anything unrecognised. Terminal.
    Unknown,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::RateLimit | ErrorClass::Server | ErrorClass::Transient)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::RateLimit => "rate_limit",
            ErrorClass::Server => "server",
            ErrorClass::Transient => "transient",
            ErrorClass::Client => "client",
            ErrorClass::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Classify an error message.
pub fn classify(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    if contains_any(&lower, CANCELLED_MARKERS) {
        ErrorClass::Cancelled
    } else if contains_any(&lower, RATE_LIMIT_MARKERS) {
        ErrorClass::RateLimit
    } else if contains_any(&lower, SERVER_MARKERS) {
        ErrorClass::Server
    } else if contains_any(&lower, TRANSIENT_MARKERS) {
        ErrorClass::Transient
    } else if has_client_status(&lower) {
        ErrorClass::Client
    } else {
        ErrorClass::Unknown
    }
}

/// Default rate-limit predicate: `"429"`, `"rate limit"` or `"too many requests"`.
pub fn is_rate_limit_message(message: &str) -> bool {
    contains_any(&message.to_lowercase(), RATE_LIMIT_MARKERS)
}

/// Case-insensitive match of `message` against any of `patterns`.
pub fn matches_any<S: AsRef<str>>(message: &str, patterns: &[S]) -> bool {
    let lower = message.to_lowercase();
    patterns.iter().any(|p| lower.contains(&p.as_ref().to_lowercase()))
}

fn contains_any(lower: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| lower.contains(m))
}

// A standalone three-digit 4xx token, e.g. "HTTP 404" or "status=403".
fn has_client_status(lower: &str) -> bool {
    lower
        .split(|c: char| !c.is_ascii_digit())
        .filter(|token| token.len() == 3)
        .filter_map(|token| token.parse::<u16>().ok())
        .any(|code| (400..500).contains(&code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rate_limits_before_server_errors() {
        assert_eq!(classify("HTTP 429: Too Many Requests"), ErrorClass::RateLimit);
        assert_eq!(classify("Rate limit exceeded"), ErrorClass::RateLimit);
    }

    #[test]
    fn classifies_server_and_transient() {
        assert_eq!(classify("HTTP 503 Service Unavailable"), ErrorClass::Server);
        assert_eq!(classify("dial tcp 10.0.0.1:443: connection refused"), ErrorClass::Transient);
        assert_eq!(classify("unexpected EOF"), ErrorClass::Transient);
        assert_eq!(classify("Post: context deadline exceeded"), ErrorClass::Transient);
    }

    #[test]
    fn classifies_client_errors_as_terminal() {
        let class = classify("HTTP 404: zone not found");
        assert_eq!(class, ErrorClass::Client);
        assert!(!class.is_retryable());
        assert_eq!(classify("status=403"), ErrorClass::Client);
    }

    #[test]
    fn cancellation_wins_over_everything() {
        assert_eq!(classify("context canceled while waiting for 503"), ErrorClass::Cancelled);
        assert!(!ErrorClass::Cancelled.is_retryable());
    }

    #[test]
    fn unknown_is_terminal() {
        let class = classify("invalid tag format");
        assert_eq!(class, ErrorClass::Unknown);
        assert!(!class.is_retryable());
    }

    #[test]
    fn rate_limit_predicate_is_case_insensitive() {
        assert!(is_rate_limit_message("TOO MANY REQUESTS"));
        assert!(!is_rate_limit_message("HTTP 500"));
    }

    #[test]
    fn matches_any_lowercases_patterns() {
        assert!(matches_any("read: Connection Reset by peer", &["connection reset"]));
        assert!(matches_any("unexpected eof", &["EOF"]));
        assert!(!matches_any("bad request", DEFAULT_RETRYABLE_ERRORS));
    }
}
