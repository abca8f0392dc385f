//! Main sync server.

use crate::config::ServerConfig;
use crate::dataset::ServerDataset;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use offsync_protocol::{PullRequest, PushRequest};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// A response produced by [`SyncServer::handle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerReply {
    /// HTTP status code.
    pub status: u16,
    /// JSON body.
    pub body: Vec<u8>,
}

impl ServerReply {
    fn ok(body: Vec<u8>) -> Self {
        Self { status: 200, body }
    }

    fn error(err: &ServerError) -> Self {
        Self {
            status: err.status_code(),
            body: json!({ "error": err.to_string() }).to_string().into_bytes(),
        }
    }
}

/// The sync server.
///
/// Routes `GET …/pull` and `POST …/push` onto an in-memory dataset.
///
/// # Example
///
/// ```
/// use offsync_server::{ServerConfig, SyncServer};
///
/// let server = SyncServer::new(ServerConfig::default());
/// let reply = server.handle("GET", "/sync/pull", None, b"");
/// assert_eq!(reply.status, 200);
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
    faults: Mutex<VecDeque<u16>>,
    requests: AtomicU64,
}

impl SyncServer {
    /// Creates a new sync server.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_dataset(config, Arc::new(ServerDataset::new()))
    }

    /// Creates a sync server over an existing dataset.
    pub fn with_dataset(config: ServerConfig, dataset: Arc<ServerDataset>) -> Self {
        let context = Arc::new(HandlerContext::new(config, dataset));
        let handler = RequestHandler::new(Arc::clone(&context));

        Self {
            handler,
            context,
            faults: Mutex::new(VecDeque::new()),
            requests: AtomicU64::new(0),
        }
    }

    /// Handles one HTTP request.
    ///
    /// `path_and_query` is the request target without scheme and host;
    /// `authorization` is the raw `Authorization` header.
    pub fn handle(
        &self,
        method: &str,
        path_and_query: &str,
        authorization: Option<&str>,
        body: &[u8],
    ) -> ServerReply {
        self.requests.fetch_add(1, Ordering::Relaxed);
        match self.route(method, path_and_query, authorization, body) {
            Ok(reply) => reply,
            Err(err) => {
                if err.is_server_error() {
                    warn!(method, path = path_and_query, error = %err, "sync request failed");
                } else {
                    debug!(method, path = path_and_query, error = %err, "sync request rejected");
                }
                ServerReply::error(&err)
            }
        }
    }

    fn route(
        &self,
        method: &str,
        path_and_query: &str,
        authorization: Option<&str>,
        body: &[u8],
    ) -> ServerResult<ServerReply> {
        if let Some(status) = self.faults.lock().pop_front() {
            return Err(ServerError::Injected(status));
        }

        let (path, query) = path_and_query
            .split_once('?')
            .unwrap_or((path_and_query, ""));
        let endpoint = path.trim_end_matches('/').rsplit('/').next().unwrap_or("");

        match (endpoint, method) {
            ("pull", "GET") => {
                self.handler.authorize(authorization)?;
                let response = self.handler.handle_pull(PullRequest::from_query(query))?;
                Ok(ServerReply::ok(response.encode()?))
            }
            ("push", "POST") => {
                self.handler.authorize(authorization)?;
                let request = PushRequest::decode(body)?;
                let timestamp = self.handler.handle_push(request)?;
                Ok(ServerReply::ok(
                    json!({ "timestamp": timestamp }).to_string().into_bytes(),
                ))
            }
            ("pull", _) | ("push", _) => Err(ServerError::MethodNotAllowed {
                method: method.to_string(),
                path: path.to_string(),
            }),
            _ => Err(ServerError::NotFound(path.to_string())),
        }
    }

    /// Makes the next request fail with `status`; calls queue up.
    pub fn fail_next(&self, status: u16) {
        self.faults.lock().push_back(status);
    }

    /// Issues a bearer token, or `None` when authentication is disabled.
    pub fn issue_token(&self, subject: &str) -> Option<String> {
        self.context
            .validator()
            .and_then(|validator| validator.create_token(subject).ok())
    }

    /// Returns the canonical dataset.
    pub fn dataset(&self) -> &Arc<ServerDataset> {
        &self.context.dataset
    }

    /// Returns the current server timestamp.
    pub fn timestamp(&self) -> i64 {
        self.context.dataset.timestamp()
    }

    /// Returns the number of requests handled so far.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_protocol::{PullResponse, Record, SyncDatabaseChangeSet};
    use serde_json::{Map, Value};

    fn push_body(ids: &[&str], last_pulled_at: Option<i64>) -> Vec<u8> {
        let mut changes = SyncDatabaseChangeSet::new();
        for id in ids {
            changes
                .table_mut("tasks")
                .updated
                .push(Record::synced(*id, Map::new()));
        }
        PushRequest::new(changes, last_pulled_at).encode().unwrap()
    }

    #[test]
    fn server_lifecycle() {
        let server = SyncServer::new(ServerConfig::default());
        assert_eq!(server.timestamp(), 0);
        assert!(server.dataset().is_empty());
        assert_eq!(server.request_count(), 0);
    }

    #[test]
    fn full_sync_flow() {
        let server = SyncServer::new(ServerConfig::default());

        let reply = server.handle("GET", "/sync/pull", None, b"");
        assert_eq!(reply.status, 200);
        let pulled = PullResponse::decode(&reply.body).unwrap();
        assert!(pulled.changes.is_empty());

        let reply = server.handle("POST", "/sync/push", None, &push_body(&["a", "b"], None));
        assert_eq!(reply.status, 200);
        let body: Value = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(body["timestamp"], 1);

        let reply = server.handle("GET", "/sync/pull?last_pulled_at=0", None, b"");
        let pulled = PullResponse::decode(&reply.body).unwrap();
        assert_eq!(pulled.changes.len(), 2);
        assert_eq!(pulled.timestamp, 1);
    }

    #[test]
    fn routing_errors() {
        let server = SyncServer::new(ServerConfig::default());
        assert_eq!(server.handle("GET", "/sync/other", None, b"").status, 404);
        assert_eq!(server.handle("POST", "/sync/pull", None, b"").status, 405);
        assert_eq!(server.handle("POST", "/sync/push", None, b"{").status, 400);
    }

    #[test]
    fn injected_faults_are_consumed_in_order() {
        let server = SyncServer::new(ServerConfig::default());
        server.fail_next(503);
        server.fail_next(401);

        assert_eq!(server.handle("GET", "/pull", None, b"").status, 503);
        assert_eq!(server.handle("GET", "/pull", None, b"").status, 401);
        assert_eq!(server.handle("GET", "/pull", None, b"").status, 200);
        assert_eq!(server.request_count(), 3);
    }

    #[test]
    fn authentication_is_enforced() {
        let server = SyncServer::new(ServerConfig::default().with_auth(b"secret".to_vec()));
        let token = server.issue_token("device-1").unwrap();

        let reply = server.handle("GET", "/pull", None, b"");
        assert_eq!(reply.status, 401);
        let body: Value = serde_json::from_slice(&reply.body).unwrap();
        assert!(body["error"].as_str().unwrap().contains("missing bearer token"));

        let header = format!("Bearer {token}");
        assert_eq!(server.handle("GET", "/pull", Some(&header), b"").status, 200);
        assert_eq!(
            server.handle("GET", "/pull", Some("Bearer device-1.0.00"), b"").status,
            401
        );
    }

    #[test]
    fn shared_dataset() {
        let dataset = Arc::new(ServerDataset::new());
        let server = SyncServer::with_dataset(ServerConfig::default(), Arc::clone(&dataset));

        server.handle("POST", "/push", None, &push_body(&["a"], None));
        assert_eq!(dataset.len("tasks"), 1);
        assert!(server.issue_token("x").is_none());
    }
}
