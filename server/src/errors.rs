//! Error kinds recognized across the service.
//!
//! Every fallible path returns [`Error`]. Structured key/value context is
//! attached with [`Error::context`] and survives wrapping — the chain prints
//! innermost-first so logs keep the full trail while user-visible strings
//! stay terse. `Cancelled` and `DeadlineExceeded` propagate unchanged; they
//! are never wrapped.

use peerdb_core::document::DuplicateClaim;
use peerdb_core::{FilterViolation, IdentifierError, TimestampError};
use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Registry lookup or store miss. Surfaced as a 404-equivalent.
    #[error("{0} not found")]
    NotFound(String),

    /// Filter validation, bad identifier, bad JSON. Carries the first violation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A prompt is still parsing; callers poll.
    #[error("search state is not ready")]
    NotReady,

    /// Value translation the ingester cannot express. Skipped with a log entry.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The surrounding scope was cancelled. Propagated, never wrapped.
    #[error("cancelled")]
    Cancelled,

    /// A deadline elapsed. Propagated, never wrapped.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Network failure, 5xx, or serialization conflict. Retried with backoff.
    #[error("transient: {message}")]
    Transient {
        message: String,
        /// Server-provided retry hint, honored by the backoff wrapper.
        retry_after: Option<Duration>,
    },

    /// Logic bug or corrupt state. Aborts the operation with a full trace.
    #[error("fatal: {0}")]
    Fatal(String),

    /// A key/value annotation wrapped around another error.
    #[error("{source} ({key}={value})")]
    Context {
        key: &'static str,
        value: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        Error::Unsupported(what.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Error::Transient { message: message.into(), retry_after: None }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Error::Fatal(message.into())
    }

    /// Attach a key/value pair. Cancellation and deadline errors pass
    /// through untouched.
    pub fn context(self, key: &'static str, value: impl ToString) -> Self {
        match self {
            Error::Cancelled | Error::DeadlineExceeded => self,
            other => Error::Context { key, value: value.to_string(), source: Box::new(other) },
        }
    }

    /// The innermost non-context error.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.root(), Error::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound(_))
    }

    /// Server-provided retry hint, if the root error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self.root() {
            Error::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<FilterViolation> for Error {
    fn from(v: FilterViolation) -> Self {
        Error::InvalidArgument(v.to_string())
    }
}

impl From<IdentifierError> for Error {
    fn from(e: IdentifierError) -> Self {
        Error::InvalidArgument(e.to_string())
    }
}

impl From<TimestampError> for Error {
    fn from(e: TimestampError) -> Self {
        Error::InvalidArgument(e.to_string())
    }
}

impl From<DuplicateClaim> for Error {
    fn from(e: DuplicateClaim) -> Self {
        Error::InvalidArgument(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidArgument(format!("bad JSON: {e}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Error::DeadlineExceeded;
        }
        if let Some(status) = e.status() {
            if status.is_server_error() || status.as_u16() == 429 {
                return Error::Transient {
                    message: format!("upstream returned {status}"),
                    retry_after: None,
                };
            }
            return Error::fatal(format!("upstream returned {status}: {e}"));
        }
        // Connection-level failures are worth another attempt.
        Error::transient(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_survives_wrapping() {
        let err = Error::transient("connection reset")
            .context("document", "4Zz7bZVSdDLmfKnpRXGjpR")
            .context("attempt", 3);
        assert!(err.is_transient());
        let rendered = err.to_string();
        assert!(rendered.contains("connection reset"));
        assert!(rendered.contains("document=4Zz7bZVSdDLmfKnpRXGjpR"));
        assert!(rendered.contains("attempt=3"));
    }

    #[test]
    fn cancellation_is_never_wrapped() {
        let err = Error::Cancelled.context("document", "x");
        assert!(matches!(err, Error::Cancelled));
        let err = Error::DeadlineExceeded.context("attempt", 1);
        assert!(matches!(err, Error::DeadlineExceeded));
    }

    #[test]
    fn retry_hint_reaches_through_context() {
        let err = Error::Transient {
            message: "429".into(),
            retry_after: Some(Duration::from_secs(2)),
        }
        .context("operation", "search");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }
}
