//! Protocol messages for pull and push.

use crate::changeset::SyncDatabaseChangeSet;
use crate::error::ProtocolResult;
use serde::{Deserialize, Serialize};

/// Query parameter carrying the pull cursor.
pub const LAST_PULLED_AT_PARAM: &str = "last_pulled_at";

/// Pull request from client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullRequest {
    /// Server timestamp of the last successful pull, `None` on first sync.
    pub last_pulled_at: Option<i64>,
}

impl PullRequest {
    /// Creates a new pull request.
    pub fn new(last_pulled_at: Option<i64>) -> Self {
        Self { last_pulled_at }
    }

    /// Encodes the request as a URL query string (without the leading `?`).
    pub fn to_query(&self) -> String {
        match self.last_pulled_at {
            Some(ts) => format!("{LAST_PULLED_AT_PARAM}={ts}"),
            None => String::new(),
        }
    }

    /// Decodes a request from a URL query string.
    ///
    /// Unknown parameters are ignored; an unparsable cursor is treated as absent.
    pub fn from_query(query: &str) -> Self {
        let last_pulled_at = query
            .trim_start_matches('?')
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == LAST_PULLED_AT_PARAM)
            .and_then(|(_, value)| value.parse().ok());
        Self { last_pulled_at }
    }
}

/// Pull response from server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Changes since the requested cursor.
    #[serde(default)]
    pub changes: SyncDatabaseChangeSet,
    /// Server timestamp to use as the next pull cursor.
    pub timestamp: i64,
}

impl PullResponse {
    /// Creates a new pull response.
    pub fn new(changes: SyncDatabaseChangeSet, timestamp: i64) -> Self {
        Self { changes, timestamp }
    }

    /// Encodes to JSON.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes from JSON and checks bucket exclusivity.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let response: Self = serde_json::from_slice(bytes)?;
        response.changes.validate()?;
        Ok(response)
    }
}

/// Push request from client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Local changes to apply on the server.
    pub changes: SyncDatabaseChangeSet,
    /// Cursor of the pull that preceded this push.
    #[serde(rename = "lastPulledAt")]
    pub last_pulled_at: Option<i64>,
}

impl PushRequest {
    /// Creates a new push request.
    pub fn new(changes: SyncDatabaseChangeSet, last_pulled_at: Option<i64>) -> Self {
        Self {
            changes,
            last_pulled_at,
        }
    }

    /// Encodes to JSON.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes from JSON and checks bucket exclusivity.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let request: Self = serde_json::from_slice(bytes)?;
        request.changes.validate()?;
        Ok(request)
    }
}
