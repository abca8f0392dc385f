//! Sync state machine states and statistics.

use serde::{Serialize, Serializer};
use std::fmt;
use std::time::Instant;

/// Network phase of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    /// Fetching remote changes.
    Pull,
    /// Sending local changes.
    Push,
}

impl SyncPhase {
    /// Returns the wire name of the phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Pull => "pull",
            SyncPhase::Push => "push",
        }
    }
}

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// No attempt has run yet.
    Idle,
    /// An attempt was accepted and is about to pull.
    SyncRequested,
    /// A pull or push request is in flight.
    Syncing(SyncPhase),
    /// The pull response is being written locally.
    Applying,
    /// Waiting for the host to flush its outbound queue.
    WaitingForQueue,
    /// Waiting for the backoff timer.
    RetryScheduled,
    /// The server rejected the credentials.
    AuthRequired,
    /// The last attempt completed.
    Done,
    /// The last attempt failed.
    Error,
    /// The last attempt gave up on authentication.
    AuthFailed,
}

impl SyncState {
    /// Returns the wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::SyncRequested => "sync_requested",
            SyncState::Syncing(SyncPhase::Pull) => "syncing(pull)",
            SyncState::Syncing(SyncPhase::Push) => "syncing(push)",
            SyncState::Applying => "applying",
            SyncState::WaitingForQueue => "waiting_for_queue",
            SyncState::RetryScheduled => "retry_scheduled",
            SyncState::AuthRequired => "auth_required",
            SyncState::Done => "done",
            SyncState::Error => "error",
            SyncState::AuthFailed => "auth_failed",
        }
    }

    /// Returns true if an attempt is in progress.
    pub fn is_busy(&self) -> bool {
        !self.can_start_sync()
    }

    /// Returns true if the state ends an attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncState::Done | SyncState::Error | SyncState::AuthFailed)
    }

    /// Returns true if the engine can start a new attempt.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncState::Idle) || self.is_terminal()
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SyncState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Attempts that ended in `done`.
    pub attempts_completed: u64,
    /// Attempts that ended in `error` or `auth_failed`.
    pub attempts_failed: u64,
    /// Remote records written locally.
    pub records_pulled: u64,
    /// Local changes accepted by the server.
    pub records_pushed: u64,
    /// Merges of a remote record into a pending local record.
    pub conflicts_resolved: u64,
    /// Backoff retries scheduled.
    pub retries: u64,
    /// Bearer token refreshes.
    pub auth_refreshes: u64,
    /// Time of the last completed attempt.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names() {
        assert_eq!(SyncState::Syncing(SyncPhase::Pull).as_str(), "syncing(pull)");
        assert_eq!(SyncState::WaitingForQueue.to_string(), "waiting_for_queue");
        assert_eq!(
            serde_json::to_value(SyncState::AuthFailed).unwrap(),
            serde_json::json!("auth_failed")
        );
        assert_eq!(
            serde_json::to_value(SyncPhase::Push).unwrap(),
            serde_json::json!("push")
        );
    }

    #[test]
    fn start_gates() {
        assert!(SyncState::Idle.can_start_sync());
        assert!(SyncState::Done.can_start_sync());
        assert!(SyncState::Error.can_start_sync());
        assert!(SyncState::AuthFailed.can_start_sync());

        for busy in [
            SyncState::SyncRequested,
            SyncState::Syncing(SyncPhase::Pull),
            SyncState::Applying,
            SyncState::WaitingForQueue,
            SyncState::Syncing(SyncPhase::Push),
            SyncState::RetryScheduled,
            SyncState::AuthRequired,
        ] {
            assert!(busy.is_busy(), "{busy} should be busy");
            assert!(!busy.is_terminal());
        }
    }
}
