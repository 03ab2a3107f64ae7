//! Branch failure classification.
//!
//! Executors map their native failures onto [`ErrorKind`] once, at the point
//! where they call the external service. Retry decisions only ever look at the
//! kind; the message is carried along for the store and the logs.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a transient failure is expected to clear up on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientCause {
    /// Rate limit or quota exhausted (HTTP 429, RESOURCE_EXHAUSTED).
    RateLimited,
    /// Upstream deadline exceeded (HTTP 408/504, DEADLINE_EXCEEDED).
    DeadlineExceeded,
    /// Service temporarily unavailable (HTTP 503, UNAVAILABLE).
    Unavailable,
    /// Internal server error (HTTP 500/502/5xx, INTERNAL).
    Internal,
}

impl TransientCause {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        }
    }
}

/// Closed classification of a branch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient(TransientCause),
    /// The attempt outlived the run's per-branch timeout.
    Timeout,
    /// Validation failures, programming errors, anything else. Never retried.
    Fatal,
}

impl ErrorKind {
    /// Classify an HTTP status code.
    ///
    /// Only the status is consulted; message text is never inspected.
    #[must_use]
    pub const fn from_status(status: u16) -> Self {
        match status {
            429 => Self::Transient(TransientCause::RateLimited),
            408 | 504 => Self::Transient(TransientCause::DeadlineExceeded),
            503 => Self::Transient(TransientCause::Unavailable),
            500..=599 => Self::Transient(TransientCause::Internal),
            _ => Self::Fatal,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient(cause) => cause.as_str(),
            Self::Timeout => "timeout",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a branch executor (or synthesized by the runner).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct BranchError {
    kind: ErrorKind,
    message: String,
}

impl BranchError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(cause: TransientCause, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient(cause), message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    #[must_use]
    pub fn timeout(elapsed: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("attempt exceeded {}ms", elapsed.as_millis()),
        )
    }

    /// Build an error from an HTTP status and response detail.
    pub fn from_status(status: u16, detail: impl AsRef<str>) -> Self {
        Self::new(
            ErrorKind::from_status(status),
            format!("HTTP {status}: {}", detail.as_ref()),
        )
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}
