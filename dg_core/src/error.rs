// ABOUTME: Error taxonomy shared by the pool, manager and observability crates.
// ABOUTME: Every error maps to a stable category and a user-safe message.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Core error type for dbguard
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The circuit breaker is open; the backing store was not contacted.
    #[error("Backing store unavailable, circuit breaker open (retry in {retry_after:?})")]
    ResourceUnavailable { retry_after: Duration },

    #[error("Timed out acquiring a connection after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Failed to acquire a connection: {0}")]
    ConnectFailed(#[source] BackendError),

    /// An operation failed after all permitted attempts.
    #[error("Operation failed after {attempts} attempt(s): {source}")]
    QueryExecutionFailed {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Backing store error: {0}")]
    Backend(#[from] BackendError),

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Operation cancelled")]
    Cancelled,
}

/// Stable machine-readable error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Config,
    Io,
    ResourceUnavailable,
    ConnectTimeout,
    ConnectFailed,
    QueryExecutionFailed,
    Backend,
    PoolClosed,
    Cancelled,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Config => "config",
            ErrorCategory::Io => "io",
            ErrorCategory::ResourceUnavailable => "resource_unavailable",
            ErrorCategory::ConnectTimeout => "connect_timeout",
            ErrorCategory::ConnectFailed => "connect_failed",
            ErrorCategory::QueryExecutionFailed => "query_execution_failed",
            ErrorCategory::Backend => "backend",
            ErrorCategory::PoolClosed => "pool_closed",
            ErrorCategory::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) => ErrorCategory::Config,
            Error::Io(_) => ErrorCategory::Io,
            Error::ResourceUnavailable { .. } => ErrorCategory::ResourceUnavailable,
            Error::ConnectTimeout(_) => ErrorCategory::ConnectTimeout,
            Error::ConnectFailed(_) => ErrorCategory::ConnectFailed,
            Error::QueryExecutionFailed { .. } => ErrorCategory::QueryExecutionFailed,
            Error::Backend(_) => ErrorCategory::Backend,
            Error::PoolClosed => ErrorCategory::PoolClosed,
            Error::Cancelled => ErrorCategory::Cancelled,
        }
    }

    /// Message safe to show to end users. Never includes the underlying cause.
    pub fn user_message(&self) -> &'static str {
        match self {
            Error::Config(_) => "The service is misconfigured.",
            Error::Io(_) => "An internal I/O error occurred.",
            Error::ResourceUnavailable { .. } => {
                "The data store is temporarily unavailable. Please retry later."
            }
            Error::ConnectTimeout(_) => "The data store is busy. Please retry shortly.",
            Error::ConnectFailed(_) => "Could not connect to the data store.",
            Error::QueryExecutionFailed { .. } => "The request could not be completed.",
            Error::Backend(_) => "The data store reported an error.",
            Error::PoolClosed => "The service is shutting down.",
            Error::Cancelled => "The request was cancelled.",
        }
    }

    /// Whether a caller may reasonably try the same request again later
    pub fn is_retry_later(&self) -> bool {
        match self {
            Error::ResourceUnavailable { .. } | Error::ConnectTimeout(_) => true,
            Error::ConnectFailed(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Error::Config(format!("Config validation failed: {}", err))
    }
}

/// Category of failure reported by a backing-store client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    Timeout,
    ConnectionReset,
    NetworkUnreachable,
    ConnectionRefused,
    Auth,
    Query,
    Other,
}

impl BackendErrorKind {
    /// Kinds that are expected to succeed when tried again
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            BackendErrorKind::Timeout
                | BackendErrorKind::ConnectionReset
                | BackendErrorKind::NetworkUnreachable
        )
    }
}

/// Structured failure from the backing store
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Timeout, message)
    }

    pub fn connection_reset(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::ConnectionReset, message)
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Query, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let kind = match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => BackendErrorKind::Timeout,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => BackendErrorKind::ConnectionReset,
            ErrorKind::ConnectionRefused => BackendErrorKind::ConnectionRefused,
            ErrorKind::NotConnected | ErrorKind::AddrNotAvailable => {
                BackendErrorKind::NetworkUnreachable
            }
            ErrorKind::PermissionDenied => BackendErrorKind::Auth,
            _ => BackendErrorKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_hides_cause() {
        let err = Error::ConnectFailed(BackendError::new(
            BackendErrorKind::Auth,
            "password authentication failed for user admin",
        ));
        assert!(err.to_string().contains("admin"));
        assert!(!err.user_message().contains("admin"));
        assert_eq!(err.category(), ErrorCategory::ConnectFailed);
    }

    #[test]
    fn test_category_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCategory::ResourceUnavailable).unwrap();
        assert_eq!(json, "\"resource_unavailable\"");
        assert_eq!(
            ErrorCategory::QueryExecutionFailed.to_string(),
            "query_execution_failed"
        );
    }

    #[test]
    fn test_io_error_kinds_map_to_backend_kinds() {
        let reset: BackendError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset").into();
        assert_eq!(reset.kind, BackendErrorKind::ConnectionReset);
        assert!(reset.is_transient());

        let refused: BackendError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert_eq!(refused.kind, BackendErrorKind::ConnectionRefused);
        assert!(!refused.is_transient());
    }

    #[test]
    fn test_retry_later_errors() {
        let open = Error::ResourceUnavailable {
            retry_after: Duration::from_secs(5),
        };
        assert!(open.is_retry_later());

        let failed = Error::QueryExecutionFailed {
            attempts: 3,
            source: Box::new(Error::Backend(BackendError::query("syntax error"))),
        };
        assert!(!failed.is_retry_later());
        assert!(failed.to_string().contains("3 attempt(s)"));
    }

    #[test]
    fn test_connect_failure_retry_later_follows_backend_kind() {
        let unreachable = Error::ConnectFailed(BackendError::new(
            BackendErrorKind::NetworkUnreachable,
            "no route to host",
        ));
        assert!(unreachable.is_retry_later());

        let bad_credentials =
            Error::ConnectFailed(BackendError::new(BackendErrorKind::Auth, "bad password"));
        assert!(!bad_credentials.is_retry_later());
    }
}
