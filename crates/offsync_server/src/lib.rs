//! # OffSync Server
//!
//! Reference in-memory sync server for OffSync.
//!
//! This crate provides:
//! - Pull and push endpoints speaking the OffSync JSON protocol
//! - An in-memory canonical dataset with per-change timestamps
//! - Bearer token authentication (HMAC-SHA256 tokens)
//! - Fault injection for exercising client retry paths
//!
//! # Authentication
//!
//! Authentication is optional:
//!
//! ```rust,ignore
//! use offsync_server::{ServerConfig, SyncServer};
//!
//! let config = ServerConfig::default().with_auth(b"my-secure-secret".to_vec());
//! let server = SyncServer::new(config);
//! let token = server.issue_token("device-1");
//! ```
//!
//! # Protocol
//!
//! - `GET …/pull?last_pulled_at={ts}` returns `{changes, timestamp}` with every
//!   change newer than `ts` (everything live when absent)
//! - `POST …/push` with `{changes, lastPulledAt}` applies the changeset
//!
//! There is no transport here: hosts and tests route requests into
//! [`SyncServer::handle`].

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod dataset;
mod error;
mod handler;
mod server;

pub use auth::{AuthConfig, SimpleTokenValidator, TokenValidator};
pub use config::ServerConfig;
pub use dataset::ServerDataset;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use server::{ServerReply, SyncServer};
