//! Retry bookkeeping for one sync session.

use crate::config::RetryConfig;
use crate::error::{ErrorKind, SyncError};
use std::time::Duration;

/// What to do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Wait, then restart from pull.
    Backoff(Duration),
    /// Refresh the token, then resume the interrupted phase.
    RefreshToken,
    /// Give up; the attempt ends in `error`.
    GiveUp,
    /// Give up on credentials; the attempt ends in `auth_failed`.
    AuthExhausted,
}

/// Counts retries and credential rejections and computes backoff.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    config: RetryConfig,
    attempts: u32,
    auth_retries: u32,
}

impl RetryScheduler {
    /// Creates a scheduler with zeroed counters.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempts: 0,
            auth_retries: 0,
        }
    }

    /// Returns the number of retries scheduled so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the number of consecutive credential rejections.
    pub fn auth_retries(&self) -> u32 {
        self.auth_retries
    }

    /// Returns the 1-based number of the current attempt.
    pub fn current_attempt(&self) -> u32 {
        self.attempts + 1
    }

    /// Decides how to continue after `error`, updating the counters.
    pub fn on_failure(&mut self, error: &SyncError) -> RetryAction {
        match error.kind() {
            ErrorKind::Retriable => match self.next_delay() {
                Some(delay) => RetryAction::Backoff(delay),
                None => RetryAction::GiveUp,
            },
            ErrorKind::Auth => {
                self.auth_retries += 1;
                if self.auth_retries >= self.config.max_auth_retries {
                    RetryAction::AuthExhausted
                } else {
                    RetryAction::RefreshToken
                }
            }
            ErrorKind::Fatal | ErrorKind::Cancelled => RetryAction::GiveUp,
        }
    }

    /// Returns the next backoff, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_retries {
            return None;
        }
        self.attempts += 1;
        Some(self.config.delay_for_attempt(self.attempts))
    }

    /// Records a response that was not a credential rejection.
    pub fn on_authorized(&mut self) {
        self.auth_retries = 0;
    }

    /// Zeroes both counters.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.auth_retries = 0;
    }
}
