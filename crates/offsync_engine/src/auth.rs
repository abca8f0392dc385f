//! Bearer token ownership and refresh.

use crate::error::{SyncError, SyncResult};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Host callback producing a fresh bearer token.
///
/// Returning `None` or an empty string means no token is available.
pub trait TokenProvider: Send + Sync {
    /// Fetches a token.
    fn fetch_token(&self) -> BoxFuture<'_, Option<String>>;
}

impl<F, Fut> TokenProvider for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Option<String>> + Send + 'static,
{
    fn fetch_token(&self) -> BoxFuture<'_, Option<String>> {
        self().boxed()
    }
}

/// Owns the bearer token shared by the host and the engine.
///
/// The transport reads the token when it builds each request, so a change
/// affects the next request and never one already in flight.
#[derive(Default)]
pub struct AuthCoordinator {
    token: RwLock<Option<String>>,
    provider: RwLock<Option<Arc<dyn TokenProvider>>>,
}

impl AuthCoordinator {
    /// Creates a coordinator with an optional initial token.
    pub fn new(token: Option<String>) -> Self {
        let coordinator = Self::default();
        coordinator.set_token(token);
        coordinator
    }

    /// Returns the current token; empty tokens read as `None`.
    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    /// Replaces or clears the token.
    pub fn set_token(&self, token: Option<String>) {
        let token = token.filter(|t| !t.is_empty());
        debug!(present = token.is_some(), "bearer token set");
        *self.token.write() = token;
    }

    /// Registers the token provider.
    pub fn set_provider(&self, provider: Arc<dyn TokenProvider>) {
        *self.provider.write() = Some(provider);
    }

    /// Removes the token provider.
    pub fn clear_provider(&self) {
        *self.provider.write() = None;
    }

    /// Returns true if a token provider is registered.
    pub fn has_provider(&self) -> bool {
        self.provider.read().is_some()
    }

    /// Asks the provider for a new token and installs it.
    pub async fn refresh(&self) -> SyncResult<String> {
        let provider = self.provider.read().clone();
        let Some(provider) = provider else {
            warn!("credentials rejected and no token provider is registered");
            return Err(SyncError::AuthUnavailable(
                "no token provider registered".into(),
            ));
        };

        match provider.fetch_token().await.filter(|t| !t.is_empty()) {
            Some(token) => {
                *self.token.write() = Some(token.clone());
                info!("bearer token refreshed");
                Ok(token)
            }
            None => {
                warn!("token provider returned no token");
                Err(SyncError::AuthUnavailable(
                    "token provider returned no token".into(),
                ))
            }
        }
    }
}

impl std::fmt::Debug for AuthCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthCoordinator")
            .field("token", &self.token.read().as_ref().map(|_| "<redacted>"))
            .field("provider", &self.has_provider())
            .finish()
    }
}
