//! Transport layer abstraction for sync operations.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// HTTP method of a sync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Pull.
    Get,
    /// Push.
    Post,
}

/// An outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Request method.
    pub method: Method,
    /// Absolute URL including the query string.
    pub url: String,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Option<Vec<u8>>,
    /// Deadline for the whole exchange.
    pub timeout: Duration,
}

impl HttpRequest {
    /// Returns a header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns the path and query part of the URL.
    pub fn path_and_query(&self) -> &str {
        let without_scheme = match self.url.find("://") {
            Some(i) => &self.url[i + 3..],
            None => self.url.as_str(),
        };
        match without_scheme.find('/') {
            Some(i) => &without_scheme[i..],
            None => "/",
        }
    }
}

/// A received response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport. An `Err` means
/// no response was received at all (connection refused, reset, DNS failure);
/// any status code, including errors, is an `Ok` response.
pub trait HttpClient: Send + Sync {
    /// Sends a request.
    fn send(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, String>> + Send;
}

impl<C: HttpClient> HttpClient for Arc<C> {
    fn send(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, String>> + Send {
        (**self).send(request)
    }
}

/// Scripted reply of a [`MockClient`].
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Answer with a response.
    Respond(HttpResponse),
    /// Fail without a response.
    Fail(String),
    /// Never answer.
    Hang,
}

impl MockReply {
    /// Answers with a JSON body.
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        MockReply::Respond(HttpResponse::new(status, body.to_string()))
    }

    /// Answers with a status and an empty body.
    pub fn status(status: u16) -> Self {
        MockReply::Respond(HttpResponse::new(status, Vec::new()))
    }
}

/// A scripted client for testing.
///
/// GET requests consume the pull queue and POST requests the push queue.
/// An empty pull queue answers with no changes at timestamp 0; an empty push
/// queue answers 200.
#[derive(Debug, Default)]
pub struct MockClient {
    pulls: Mutex<VecDeque<MockReply>>,
    pushes: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockClient {
    /// Creates a client with empty queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reply for the next pull.
    pub fn queue_pull(&self, reply: MockReply) {
        self.pulls.lock().push_back(reply);
    }

    /// Queues a reply for the next push.
    pub fn queue_push(&self, reply: MockReply) {
        self.pushes.lock().push_back(reply);
    }

    /// Returns every request received so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Returns the number of requests with the given method.
    pub fn count(&self, method: Method) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == method)
            .count()
    }

    fn next_reply(&self, method: Method) -> MockReply {
        let queued = match method {
            Method::Get => self.pulls.lock().pop_front(),
            Method::Post => self.pushes.lock().pop_front(),
        };
        queued.unwrap_or_else(|| match method {
            Method::Get => MockReply::json(200, serde_json::json!({"changes": {}, "timestamp": 0})),
            Method::Post => MockReply::status(200),
        })
    }
}

impl HttpClient for MockClient {
    fn send(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, String>> + Send {
        let reply = self.next_reply(request.method);
        self.requests.lock().push(request);
        async move {
            match reply {
                MockReply::Respond(response) => Ok(response),
                MockReply::Fail(message) => Err(message),
                MockReply::Hang => std::future::pending().await,
            }
        }
    }
}
