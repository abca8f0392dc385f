//! HTTP transport implementation.
//!
//! Pull is a `GET {pull_url}?last_pulled_at={cursor}`, push is a
//! `POST {push_url}` with a JSON body. Both carry the current bearer token and
//! an explicit timeout. The actual HTTP client is abstracted via
//! [`HttpClient`].

use crate::auth::AuthCoordinator;
use crate::error::{SyncError, SyncResult};
use crate::transport::{HttpClient, HttpRequest, HttpResponse, Method};
use offsync_protocol::{PullRequest, PullResponse, PushRequest};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP-based sync transport.
pub struct HttpTransport<C: HttpClient> {
    client: C,
    pull_url: String,
    push_url: String,
    timeout: Duration,
    auth: Arc<AuthCoordinator>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(
        client: C,
        pull_url: impl Into<String>,
        push_url: impl Into<String>,
        timeout: Duration,
        auth: Arc<AuthCoordinator>,
    ) -> Self {
        Self {
            client,
            pull_url: pull_url.into(),
            push_url: push_url.into(),
            timeout,
            auth,
        }
    }

    /// Returns the pull URL.
    pub fn pull_url(&self) -> &str {
        &self.pull_url
    }

    /// Returns the push URL.
    pub fn push_url(&self) -> &str {
        &self.push_url
    }

    /// Builds the pull request with the token current at this moment.
    pub fn pull_request(&self, request: &PullRequest) -> HttpRequest {
        let query = request.to_query();
        let url = if query.is_empty() {
            self.pull_url.clone()
        } else if self.pull_url.contains('?') {
            format!("{}&{query}", self.pull_url)
        } else {
            format!("{}?{query}", self.pull_url)
        };
        self.build(Method::Get, url, None)
    }

    /// Builds the push request with the token current at this moment.
    pub fn push_request(&self, request: &PushRequest) -> SyncResult<HttpRequest> {
        let body = request.encode()?;
        Ok(self.build(Method::Post, self.push_url.clone(), Some(body)))
    }

    /// Sends a pull request. Only transport failures are errors here.
    pub async fn pull(&self, request: &PullRequest) -> SyncResult<HttpResponse> {
        self.send(self.pull_request(request)).await
    }

    /// Sends a push request. Only transport failures are errors here.
    pub async fn push(&self, request: &PushRequest) -> SyncResult<HttpResponse> {
        let request = self.push_request(request)?;
        self.send(request).await
    }

    /// Maps a pull response to its payload.
    pub fn decode_pull(&self, response: &HttpResponse) -> SyncResult<PullResponse> {
        check_status(response)?;
        Ok(PullResponse::decode(&response.body)?)
    }

    /// Maps a push response to success or failure.
    pub fn check_push(&self, response: &HttpResponse) -> SyncResult<()> {
        check_status(response)
    }

    fn build(&self, method: Method, url: String, body: Option<Vec<u8>>) -> HttpRequest {
        let mut headers = vec![("Accept".to_string(), "application/json".to_string())];
        if body.is_some() {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }
        if let Some(token) = self.auth.token() {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        HttpRequest {
            method,
            url,
            headers,
            body,
            timeout: self.timeout,
        }
    }

    async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        let timeout = request.timeout;
        debug!(method = ?request.method, url = %request.url, "sending sync request");
        match tokio::time::timeout(timeout, self.client.send(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(message)) => {
                warn!(error = %message, "sync request failed");
                Err(SyncError::Network(message))
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "sync request timed out");
                Err(SyncError::Timeout(timeout))
            }
        }
    }
}

fn check_status(response: &HttpResponse) -> SyncResult<()> {
    if response.is_success() {
        Ok(())
    } else {
        Err(SyncError::http_status(response.status, &response.body))
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer {
    /// Handles a request and returns the response.
    fn handle(&self, request: &HttpRequest) -> HttpResponse;
}

impl<S: LoopbackServer + ?Sized> LoopbackServer for Arc<S> {
    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        (**self).handle(request)
    }
}

/// A loopback HTTP client that routes requests directly to a sync server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer + Send + Sync> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }

    /// Returns the server.
    pub fn server(&self) -> &S {
        &self.server
    }
}

impl<S: LoopbackServer + Send + Sync> HttpClient for LoopbackClient<S> {
    fn send(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, String>> + Send {
        let response = self.server.handle(&request);
        async move { Ok(response) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockClient, MockReply};
    use offsync_protocol::{Record, SyncDatabaseChangeSet};
    use serde_json::json;

    fn transport(client: Arc<MockClient>, token: Option<&str>) -> HttpTransport<Arc<MockClient>> {
        HttpTransport::new(
            client,
            "https://api.example.com/sync/pull",
            "https://api.example.com/sync/push",
            Duration::from_secs(5),
            Arc::new(AuthCoordinator::new(token.map(String::from))),
        )
    }

    #[test]
    fn pull_request_carries_cursor_and_token() {
        let transport = transport(Arc::new(MockClient::new()), Some("abc"));

        let first = transport.pull_request(&PullRequest::new(None));
        assert_eq!(first.method, Method::Get);
        assert_eq!(first.url, "https://api.example.com/sync/pull");
        assert_eq!(first.header("authorization"), Some("Bearer abc"));
        assert_eq!(first.timeout, Duration::from_secs(5));

        let next = transport.pull_request(&PullRequest::new(Some(42)));
        assert_eq!(next.url, "https://api.example.com/sync/pull?last_pulled_at=42");
    }

    #[test]
    fn token_is_read_at_build_time() {
        let transport = transport(Arc::new(MockClient::new()), None);
        assert_eq!(
            transport
                .pull_request(&PullRequest::default())
                .header("Authorization"),
            None
        );

        transport.auth.set_token(Some("fresh".into()));
        assert_eq!(
            transport
                .pull_request(&PullRequest::default())
                .header("Authorization"),
            Some("Bearer fresh")
        );
    }

    #[test]
    fn push_request_is_json() {
        let transport = transport(Arc::new(MockClient::new()), None);
        let mut changes = SyncDatabaseChangeSet::new();
        changes.table_mut("tasks").updated.push(Record::new("t1"));

        let request = transport
            .push_request(&PushRequest::new(changes, Some(3)))
            .unwrap();
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.header("content-type"), Some("application/json"));

        let body: serde_json::Value = serde_json::from_slice(request.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["lastPulledAt"], json!(3));
    }

    #[test]
    fn status_mapping() {
        let transport = transport(Arc::new(MockClient::new()), None);

        let ok = HttpResponse::new(200, r#"{"changes":{},"timestamp":5}"#);
        assert_eq!(transport.decode_pull(&ok).unwrap().timestamp, 5);

        let unauthorized = HttpResponse::new(401, "nope");
        assert!(matches!(
            transport.decode_pull(&unauthorized),
            Err(SyncError::HttpStatus { status: 401, .. })
        ));

        let garbage = HttpResponse::new(200, "<html>");
        assert!(matches!(
            transport.decode_pull(&garbage),
            Err(SyncError::Protocol(_))
        ));

        assert!(transport.check_push(&HttpResponse::new(204, "")).is_ok());
        assert!(transport.check_push(&HttpResponse::new(500, "")).is_err());
    }

    #[tokio::test]
    async fn network_failure_is_reported() {
        let client = Arc::new(MockClient::new());
        client.queue_pull(MockReply::Fail("connection refused".into()));
        let transport = transport(Arc::clone(&client), None);

        let err = transport.pull(&PullRequest::default()).await.unwrap_err();
        assert!(matches!(err, SyncError::Network(ref m) if m == "connection refused"));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_request_times_out() {
        let client = Arc::new(MockClient::new());
        client.queue_pull(MockReply::Hang);
        let transport = transport(Arc::clone(&client), None);

        let err = transport.pull(&PullRequest::default()).await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout(d) if d == Duration::from_secs(5)));
    }

    struct Echo;

    impl LoopbackServer for Echo {
        fn handle(&self, request: &HttpRequest) -> HttpResponse {
            HttpResponse::new(200, request.path_and_query().to_string())
        }
    }

    #[tokio::test]
    async fn loopback_routes_to_server() {
        let client = LoopbackClient::new(Echo);
        let transport = HttpTransport::new(
            client,
            "memory://sync/pull",
            "memory://sync/push",
            Duration::from_secs(1),
            Arc::new(AuthCoordinator::default()),
        );

        let response = transport.pull(&PullRequest::new(Some(1))).await.unwrap();
        assert_eq!(response.body, b"/pull?last_pulled_at=1");
    }
}
