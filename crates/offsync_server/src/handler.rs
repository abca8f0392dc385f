//! Request handlers for sync endpoints.

use crate::auth::{AuthConfig, TokenValidator};
use crate::config::ServerConfig;
use crate::dataset::ServerDataset;
use crate::error::{ServerError, ServerResult};
use offsync_protocol::{PullRequest, PullResponse, PushRequest};
use std::sync::Arc;
use tracing::{debug, warn};

/// Context for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Canonical dataset (shared across all handlers).
    pub dataset: Arc<ServerDataset>,
    validator: Option<TokenValidator>,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig, dataset: Arc<ServerDataset>) -> Self {
        let validator = match (&config.auth_secret, config.require_auth) {
            (Some(secret), true) => Some(TokenValidator::new(
                AuthConfig::new(secret.clone()).with_expiry(config.token_expiry),
            )),
            _ => None,
        };
        Self {
            config,
            dataset,
            validator,
        }
    }

    /// Returns the token validator when authentication is enabled.
    pub fn validator(&self) -> Option<&TokenValidator> {
        self.validator.as_ref()
    }
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Checks the `Authorization` header; returns the token subject.
    ///
    /// Always succeeds with `None` when authentication is disabled.
    pub fn authorize(&self, authorization: Option<&str>) -> ServerResult<Option<String>> {
        let Some(validator) = self.context.validator() else {
            return Ok(None);
        };
        let header = authorization
            .ok_or_else(|| ServerError::AuthenticationFailed("missing bearer token".into()))?;
        let token = header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ServerError::AuthenticationFailed("malformed authorization".into()))?;

        match validator.validate_token(token) {
            Ok(subject) => Ok(Some(subject)),
            Err(err) => {
                warn!(error = %err, "rejected bearer token");
                Err(err)
            }
        }
    }

    /// Handles a pull request.
    pub fn handle_pull(&self, request: PullRequest) -> ServerResult<PullResponse> {
        let response = self.context.dataset.changes_since(request.last_pulled_at);
        debug!(
            since = ?request.last_pulled_at,
            changes = response.changes.len(),
            timestamp = response.timestamp,
            "served pull"
        );
        Ok(response)
    }

    /// Handles a push request; returns the new server timestamp.
    pub fn handle_push(&self, request: PushRequest) -> ServerResult<i64> {
        let max = self.context.config.max_push_records;
        if request.changes.len() > max {
            return Err(ServerError::InvalidRequest(format!(
                "too many records: {} > {max}",
                request.changes.len()
            )));
        }
        self.context.dataset.apply_push(&request.changes)
    }
}
