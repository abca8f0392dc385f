//! Error types for the sync engine.

use offsync_protocol::ProtocolError;
use std::time::Duration;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for local storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by a local storage adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A record that must exist was not found.
    #[error("record {id} not found in table `{table}`")]
    NotFound {
        /// Table name.
        table: String,
        /// Record id.
        id: String,
    },

    /// A record that must not exist already exists.
    #[error("record {id} already exists in table `{table}`")]
    AlreadyExists {
        /// Table name.
        table: String,
        /// Record id.
        id: String,
    },

    /// A host write was rejected by the record status model.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// The storage connection for a tag is gone.
    #[error("storage connection `{0}` is closed")]
    ConnectionClosed(String),

    /// The underlying transaction failed.
    #[error("transaction failed: {0}")]
    Transaction(String),
}

/// How the retry scheduler treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient; the attempt is retried after a backoff.
    Retriable,
    /// The server rejected the credentials; a token refresh is requested.
    Auth,
    /// Permanent; the attempt ends in `error` (or `auth_failed`).
    Fatal,
    /// The attempt was cancelled.
    Cancelled,
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Connection failure reported by the HTTP client.
    #[error("network error: {0}")]
    Network(String),

    /// The request did not complete within its timeout.
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The server answered with a non-success status.
    #[error("server responded with status {status}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Response body, lossily decoded.
        body: String,
    },

    /// Local storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Malformed server payload.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The server kept rejecting credentials.
    #[error("authentication failed after {retries} attempts")]
    AuthExhausted {
        /// Number of credential failures observed.
        retries: u32,
    },

    /// Credentials were rejected and no fresh token could be obtained.
    #[error("authentication required: {0}")]
    AuthUnavailable(String),

    /// The retry budget is spent.
    #[error("giving up after {attempts} retries: {last}")]
    RetriesExhausted {
        /// Number of retries performed.
        attempts: u32,
        /// The last retriable error.
        last: Box<SyncError>,
    },

    /// The attempt was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The engine worker is no longer running.
    #[error("sync engine is stopped")]
    EngineStopped,
}

impl SyncError {
    /// Builds an HTTP status error from a response body.
    pub fn http_status(status: u16, body: &[u8]) -> Self {
        Self::HttpStatus {
            status,
            body: String::from_utf8_lossy(body).into_owned(),
        }
    }

    /// Classifies the error for the retry scheduler.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Network(_) | SyncError::Timeout(_) | SyncError::Storage(_) => {
                ErrorKind::Retriable
            }
            SyncError::HttpStatus { status, .. } => match status {
                401 | 403 => ErrorKind::Auth,
                500..=599 => ErrorKind::Retriable,
                _ => ErrorKind::Fatal,
            },
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::Protocol(_)
            | SyncError::AuthExhausted { .. }
            | SyncError::AuthUnavailable(_)
            | SyncError::RetriesExhausted { .. }
            | SyncError::Config(_)
            | SyncError::EngineStopped => ErrorKind::Fatal,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retriable
    }

    /// Returns true if the error ends an attempt in `auth_failed` rather than `error`.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            SyncError::AuthExhausted { .. } | SyncError::AuthUnavailable(_)
        )
    }
}
