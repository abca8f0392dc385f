//! Error types for the sync server.

use offsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Malformed protocol payload.
    #[error("invalid payload: {0}")]
    Protocol(#[from] ProtocolError),

    /// No usable credentials were presented.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The presented token was rejected.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// No endpoint at this path.
    #[error("no endpoint at `{0}`")]
    NotFound(String),

    /// Wrong method for an existing endpoint.
    #[error("method {method} not allowed on `{path}`")]
    MethodNotAllowed {
        /// Request method.
        method: String,
        /// Request path.
        path: String,
    },

    /// A status injected with `SyncServer::fail_next`.
    #[error("injected failure with status {0}")]
    Injected(u16),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns the HTTP status for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) | ServerError::Protocol(_) => 400,
            ServerError::AuthenticationFailed(_) | ServerError::NotAuthorized(_) => 401,
            ServerError::NotFound(_) => 404,
            ServerError::MethodNotAllowed { .. } => 405,
            ServerError::Injected(status) => *status,
            ServerError::Internal(_) => 500,
        }
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }
}
