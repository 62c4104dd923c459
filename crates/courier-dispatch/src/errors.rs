//! Dispatch error types and transport error classification.

use std::time::Duration;

use courier_core::{Categorize, ErrorCategory};
use thiserror::Error;

/// Outcome of a failed dispatch.
///
/// `Clone` so one outcome can be delivered to every waiter of a compacted
/// entry.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The downstream service asked us to back off. The limiter retries
    /// these itself.
    #[error("throttled, retry after {}s", retry_after.as_secs_f64())]
    Throttled {
        /// Mandatory wait before the next attempt.
        retry_after: Duration,
    },
    /// The call failed and will not be retried.
    #[error("dispatch failed: {0}")]
    Failed(String),
    /// The limiter shut down before the entry ran.
    #[error("rate limiter stopped")]
    Stopped,
    /// The dispatcher went away without answering.
    #[error("dispatch dropped before completion")]
    Dropped,
    /// A compacted entry produced a value of a different type than this
    /// caller expected.
    #[error("dispatch result has an unexpected type")]
    TypeMismatch,
}

/// Phrases that mark a transport error as a throttle signal.
const THROTTLE_MARKERS: [&str; 4] = ["flood", "retry after", "retry in", "too many requests"];

/// Phrases directly followed by the wait in seconds.
const WAIT_MARKERS: [&str; 3] = ["retry after", "retry in", "wait of"];

impl DispatchError {
    /// Shorthand for [`DispatchError::Throttled`].
    pub fn throttled(retry_after: Duration) -> Self {
        Self::Throttled { retry_after }
    }

    /// Shorthand for [`DispatchError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Classify a transport error message.
    ///
    /// Flood-control and too-many-requests messages become
    /// [`Throttled`](Self::Throttled), using the wait embedded in the message
    /// when present (`"retry after 12"`, `"Retry in 3.5 seconds"`) and
    /// `default_wait` otherwise. Anything else is [`Failed`](Self::Failed).
    pub fn from_message(message: &str, default_wait: Duration) -> Self {
        let lower = message.to_lowercase();
        if !THROTTLE_MARKERS.iter().any(|m| lower.contains(m)) {
            return Self::Failed(message.to_string());
        }
        let retry_after = WAIT_MARKERS
            .iter()
            .find_map(|marker| {
                let idx = lower.find(marker)?;
                parse_leading_seconds(&lower[idx + marker.len()..])
            })
            .unwrap_or(default_wait);
        Self::Throttled { retry_after }
    }

    /// Server-mandated wait, for throttle errors.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Parse `" 12 seconds"` / `": 3.5"` into a duration.
fn parse_leading_seconds(rest: &str) -> Option<Duration> {
    let rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == ':');
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let secs: f64 = rest[..end].parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

impl Categorize for DispatchError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::Throttled { .. } => ErrorCategory::Throttle,
            Self::Failed(_) => ErrorCategory::Dispatch,
            Self::Stopped | Self::Dropped => ErrorCategory::Shutdown,
            Self::TypeMismatch => ErrorCategory::Internal,
        }
    }
}

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const DEFAULT: Duration = Duration::from_secs(30);

    #[test]
    fn telegram_retry_after() {
        let err = DispatchError::from_message("Flood control exceeded. Retry in 35 seconds", DEFAULT);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(35)));
    }

    #[test]
    fn http_too_many_requests() {
        let err = DispatchError::from_message("429 Too Many Requests: retry after 2.5", DEFAULT);
        assert_eq!(err.retry_after(), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn flood_without_wait_uses_default() {
        let err = DispatchError::from_message("FLOOD_WAIT", DEFAULT);
        assert_eq!(err, DispatchError::throttled(DEFAULT));
    }

    #[test]
    fn unrepresentable_wait_falls_back_to_default() {
        let err = DispatchError::from_message(
            "Too Many Requests: retry after 100000000000000000000",
            DEFAULT,
        );
        assert_eq!(err, DispatchError::throttled(DEFAULT));
    }

    #[test]
    fn other_errors_are_fatal() {
        let err = DispatchError::from_message("Bad Request: message is not modified", DEFAULT);
        assert_matches!(err, DispatchError::Failed(m) if m.contains("not modified"));
    }

    #[test]
    fn categories() {
        assert!(DispatchError::throttled(DEFAULT).is_retryable());
        assert!(!DispatchError::failed("x").is_retryable());
        assert_eq!(DispatchError::Stopped.category(), ErrorCategory::Shutdown);
        assert_eq!(DispatchError::TypeMismatch.category(), ErrorCategory::Internal);
    }

    #[test]
    fn display() {
        assert_eq!(
            DispatchError::throttled(Duration::from_millis(1500)).to_string(),
            "throttled, retry after 1.5s"
        );
    }
}
