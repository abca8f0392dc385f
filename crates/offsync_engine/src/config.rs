//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use serde::Deserialize;
use std::time::Duration;

/// Connection tag used when none is configured.
pub const DEFAULT_CONNECTION_TAG: &str = "default";

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// URL of the pull endpoint.
    pub pull_url: String,
    /// URL of the push endpoint.
    pub push_url: String,
    /// Initial bearer token.
    pub auth_token: Option<String>,
    /// Tag of the storage connection in the registry.
    pub connection_tag: String,
    /// Request timeout.
    pub timeout: Duration,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Whether resolved conflicts are kept in a sync log.
    pub sync_log: bool,
}

impl SyncConfig {
    /// Creates a configuration for a server base URL.
    ///
    /// Pull goes to `{endpoint}/pull` and push to `{endpoint}/push`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        let base = endpoint.trim_end_matches('/');
        Self {
            pull_url: format!("{base}/pull"),
            push_url: format!("{base}/push"),
            auth_token: None,
            connection_tag: DEFAULT_CONNECTION_TAG.to_string(),
            timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            sync_log: false,
        }
    }

    /// Overrides the pull URL.
    pub fn with_pull_url(mut self, url: impl Into<String>) -> Self {
        self.pull_url = url.into();
        self
    }

    /// Overrides the push URL.
    pub fn with_push_url(mut self, url: impl Into<String>) -> Self {
        self.push_url = url.into();
        self
    }

    /// Sets the initial bearer token.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Sets the storage connection tag.
    pub fn with_connection_tag(mut self, tag: impl Into<String>) -> Self {
        self.connection_tag = tag.into();
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Enables the conflict sync log.
    pub fn with_sync_log(mut self, enabled: bool) -> Self {
        self.sync_log = enabled;
        self
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of retries after a retriable failure.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Maximum number of consecutive credential rejections.
    pub max_auth_retries: u32,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_auth_retries: 3,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self::new(0)
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the maximum number of credential rejections.
    pub fn with_max_auth_retries(mut self, retries: u32) -> Self {
        self.max_auth_retries = retries;
        self
    }

    /// Calculates the delay before retry number `attempt` (1-indexed).
    ///
    /// `min(max_delay, initial_delay * 2^(attempt - 1))`; attempt 0 has no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Host-facing options, deserialized from camelCase JSON.
///
/// Absent options take their defaults when converted into a [`SyncConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncOptions {
    /// Server base URL.
    pub endpoint: Option<String>,
    /// Explicit pull URL.
    pub pull_url: Option<String>,
    /// Explicit push URL.
    pub push_url: Option<String>,
    /// Initial bearer token.
    pub auth_token: Option<String>,
    /// Storage connection tag.
    pub connection_tag: Option<String>,
    /// Request timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Maximum number of retries.
    pub max_retries: Option<u32>,
    /// Initial backoff in milliseconds.
    pub retry_initial_ms: Option<u64>,
    /// Backoff cap in milliseconds.
    pub retry_max_ms: Option<u64>,
    /// Maximum number of credential rejections.
    pub max_auth_retries: Option<u32>,
    /// Whether to keep a conflict sync log.
    pub sync_log: Option<bool>,
}

impl SyncOptions {
    /// Parses options from a JSON document.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Converts the options into a configuration.
    pub fn into_config(self) -> SyncResult<SyncConfig> {
        let mut config = match (self.endpoint, self.pull_url) {
            (Some(endpoint), pull_url) => {
                let config = SyncConfig::new(endpoint);
                match pull_url {
                    Some(url) => config.with_pull_url(url),
                    None => config,
                }
            }
            (None, Some(pull_url)) => {
                let push_url = derive_push_url(&pull_url);
                SyncConfig::new("")
                    .with_pull_url(pull_url)
                    .with_push_url(push_url)
            }
            (None, None) => {
                return Err(SyncError::Config(
                    "either `endpoint` or `pullUrl` is required".into(),
                ))
            }
        };

        if let Some(url) = self.push_url {
            config.push_url = url;
        }
        if let Some(token) = self.auth_token.filter(|t| !t.is_empty()) {
            config.auth_token = Some(token);
        }
        if let Some(tag) = self.connection_tag {
            config.connection_tag = tag;
        }
        if let Some(ms) = self.timeout_ms {
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = self.max_retries {
            config.retry.max_retries = retries;
        }
        if let Some(ms) = self.retry_initial_ms {
            config.retry.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.retry_max_ms {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(retries) = self.max_auth_retries {
            config.retry.max_auth_retries = retries;
        }
        config.sync_log = self.sync_log.unwrap_or(false);
        Ok(config)
    }
}

impl TryFrom<SyncOptions> for SyncConfig {
    type Error = SyncError;

    fn try_from(options: SyncOptions) -> Result<Self, Self::Error> {
        options.into_config()
    }
}

// A lone pull URL ending in `/pull` pushes to the sibling `/push`.
fn derive_push_url(pull_url: &str) -> String {
    match pull_url.strip_suffix("/pull") {
        Some(base) => format!("{base}/push"),
        None => pull_url.to_string(),
    }
}
