//! Sink Error Types
//!
//! Remote calls report one of exactly two outcomes on failure:
//! [`RemoteError::Retriable`] or [`RemoteError::Fatal`]. The retry layer
//! inspects that classification and turns exhaustion or a fatal result into
//! the caller-facing [`SinkError`].

use crate::sink::config::ConfigError;
use crate::sink::credentials::CredentialError;
use crate::sink::file::FileState;
use std::fmt;
use thiserror::Error;

/// The remote operations the sink performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Create or overwrite an object from a request body
    Upload,
    /// Concatenate source objects into a destination object
    Compose,
    /// Remove an object
    Delete,
    /// Fetch object metadata
    GetObject,
    /// Fetch bucket metadata (startup verification only)
    GetBucket,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Upload => "upload",
            Operation::Compose => "compose",
            Operation::Delete => "delete",
            Operation::GetObject => "get-object",
            Operation::GetBucket => "get-bucket",
        };
        f.write_str(name)
    }
}

/// What went wrong in a single attempt of a remote call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Failure {
    /// The store answered with a non-2xx status
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    /// The request never produced a response
    #[error("transport error: {0}")]
    Transport(String),
    /// No bearer token could be obtained for the request
    #[error("credential error: {0}")]
    Credential(String),
    /// The request body could not be serialized
    #[error("request encoding failed: {0}")]
    Encode(String),
    /// A 2xx response carried an unparseable body
    #[error("malformed response body: {0}")]
    Decode(String),
}

impl Failure {
    /// HTTP status, if the failure came from a response
    pub fn status(&self) -> Option<u16> {
        match self {
            Failure::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// HTTP statuses indicating transient unavailability.
pub fn is_retriable_status(status: u16) -> bool {
    matches!(status, 500 | 502 | 503 | 504)
}

/// Classified failure of one remote call attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Transient; the same call may be repeated
    #[error("retriable: {0}")]
    Retriable(Failure),
    /// Permanent; repeating the call cannot help
    #[error("fatal: {0}")]
    Fatal(Failure),
}

impl RemoteError {
    /// Classify a non-2xx response
    pub fn from_status(status: u16, body: String) -> Self {
        let failure = Failure::Status { status, body };
        if is_retriable_status(status) {
            RemoteError::Retriable(failure)
        } else {
            RemoteError::Fatal(failure)
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, RemoteError::Retriable(_))
    }

    pub fn failure(&self) -> &Failure {
        match self {
            RemoteError::Retriable(f) | RemoteError::Fatal(f) => f,
        }
    }

    /// True when the store reported the object (or bucket) as missing
    pub fn is_not_found(&self) -> bool {
        self.failure().status() == Some(404)
    }
}

/// Errors surfaced to callers of the sink
#[derive(Debug, Error)]
pub enum SinkError {
    /// A remote call failed fatally or ran out of attempts
    #[error("{operation} of '{object}' failed after {attempts} attempt(s): {source}")]
    Remote {
        operation: Operation,
        object: String,
        attempts: u32,
        source: RemoteError,
    },
    /// `append` was called with the buffer already holding N records
    #[error("record buffer full: {capacity} records pending, sync required")]
    CapacityExceeded { capacity: usize },
    /// The file's state does not permit the operation
    #[error("cannot {operation} a file in state {state}")]
    InvalidState {
        operation: &'static str,
        state: FileState,
    },
    /// The record encoder could not write to its destination
    #[error("record encoding failed: {0}")]
    Encoding(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("credential acquisition failed: {0}")]
    Credential(#[from] CredentialError),
    /// A file or object name cannot be used in the store
    #[error("invalid object name: {0}")]
    InvalidName(String),
}

impl SinkError {
    /// The classified remote error, if this is a remote failure
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            SinkError::Remote { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Attempts spent before giving up (1 for non-remote errors)
    pub fn attempts(&self) -> u32 {
        match self {
            SinkError::Remote { attempts, .. } => *attempts,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        for status in [500, 502, 503, 504] {
            assert!(is_retriable_status(status), "{} should be retriable", status);
            assert!(RemoteError::from_status(status, String::new()).is_retriable());
        }
        for status in [400, 401, 403, 404, 409, 412, 429, 501, 505] {
            assert!(!is_retriable_status(status), "{} should be fatal", status);
            assert!(!RemoteError::from_status(status, String::new()).is_retriable());
        }
    }

    #[test]
    fn test_not_found_detection() {
        assert!(RemoteError::from_status(404, "Not Found".into()).is_not_found());
        assert!(!RemoteError::from_status(403, "Forbidden".into()).is_not_found());
        assert!(!RemoteError::Retriable(Failure::Transport("reset".into())).is_not_found());
    }

    #[test]
    fn test_remote_error_display_includes_context() {
        let err = SinkError::Remote {
            operation: Operation::Compose,
            object: "inflight/a.rec".into(),
            attempts: 3,
            source: RemoteError::from_status(503, "backend unavailable".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("compose"));
        assert!(msg.contains("inflight/a.rec"));
        assert!(msg.contains("3 attempt"));
        assert_eq!(err.attempts(), 3);
        assert!(err.remote().is_some());
    }
}
