//! # OffSync Protocol
//!
//! Record status model, changesets and conflict resolution for OffSync.
//!
//! This crate provides:
//! - [`Record`] with its `_status` / `_changed` bookkeeping
//! - [`SyncTableChangeSet`] and [`SyncDatabaseChangeSet`]
//! - Per-column conflict resolution ([`resolve`])
//! - Pull and push messages with JSON codecs
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod changeset;
mod conflict;
mod error;
mod messages;
mod record;

pub use changeset::{SyncDatabaseChangeSet, SyncTableChangeSet};
pub use conflict::{resolve, Conflict, ConflictResolver};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{PullRequest, PullResponse, PushRequest, LAST_PULLED_AT_PARAM};
pub use record::{
    is_reserved_column, Record, RecordId, RecordStatus, CHANGED_COLUMN, ID_COLUMN, STATUS_COLUMN,
};
