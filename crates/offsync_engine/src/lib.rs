//! # OffSync Engine
//!
//! Offline-first sync engine for OffSync.
//!
//! This crate provides:
//! - Sync state machine (idle → syncing(pull) → applying → waiting_for_queue → syncing(push) → done)
//! - Change capture from local storage and settle-after-push
//! - Atomic application of pulled changesets with per-column conflict resolution
//! - HTTP transport abstraction with bearer-token refresh
//! - Retry with exponential backoff
//! - Handshake with the host's outbound mutation queue
//!
//! ## Architecture
//!
//! Each attempt follows a **pull-then-push** model:
//! 1. Pull remote changes since the stored cursor
//! 2. Apply them locally in one transaction, advancing the cursor
//! 3. Wait for the host to drain its outbound queue
//! 4. Push pending local changes and mark them synced
//!
//! A [`SyncEngine`] handle talks to a single worker task, so at most one
//! attempt runs per engine and calls made while it runs are coalesced.
//!
//! ## Key Invariants
//!
//! - Pull always happens before push
//! - A pulled batch and its cursor commit together or not at all
//! - Local edits made during a push are never marked synced
//! - A deleted record is never resurrected by a stale remote update

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod apply;
mod auth;
mod config;
mod drain;
mod engine;
mod error;
mod events;
mod http;
mod registry;
mod retry;
mod state;
mod storage;
mod tracker;
mod transport;

pub use apply::{ApplyEngine, ApplyReport, SyncLog};
pub use auth::{AuthCoordinator, TokenProvider};
pub use config::{RetryConfig, SyncConfig, SyncOptions, DEFAULT_CONNECTION_TAG};
pub use drain::QueueDrainCoordinator;
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{ErrorKind, StorageError, StorageResult, SyncError, SyncResult};
pub use events::{AttemptPhase, ChannelEvent, EngineEvent, ListenerId, ListenerRegistry, SyncEvent};
pub use http::{HttpTransport, LoopbackClient, LoopbackServer};
pub use registry::{ConnectionRegistry, ConnectionSlot};
pub use retry::{RetryAction, RetryScheduler};
pub use state::{SyncPhase, SyncState, SyncStats};
pub use storage::{LocalStorage, LocalStorageExt, MemoryStorage, StorageTxn, StorageView};
pub use tracker::ChangeTracker;
pub use transport::{HttpClient, HttpRequest, HttpResponse, Method, MockClient, MockReply};

pub use offsync_protocol;
