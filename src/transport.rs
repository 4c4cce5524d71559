//! HTTP transport seam between sessions and the agent.
//!
//! Sessions, the endpoint resolver and the capability prober only ever talk to
//! an [`AgentTransport`]. Production code uses [`ReqwestTransport`]; tests (here
//! and in downstream crates) use [`ScriptedTransport`], which replays canned
//! replies and records what was sent.
//!
//! A transport reports *transport* failures as `Err` (refused, timed out).
//! Any HTTP status, including 401 and 5xx, is a successful [`HttpReply`]; what
//! a status means is decided by the caller and the session's interceptors.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use crate::error::{ConnectError, Result};

// ---------------------------------------------------------------------------
// Request / reply
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// An outbound call, after request interceptors have run.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::Get,
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    /// A POST with a JSON body.
    pub fn post_json<T: Serialize + ?Sized>(url: Url, body: &T) -> Result<Self> {
        Ok(Self {
            method: Method::Post,
            url,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Some(serde_json::to_vec(body)?),
        })
    }

    /// First header named `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set `name`, replacing any existing value.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    /// Body parsed as JSON, for assertions on recorded requests.
    pub fn json_body(&self) -> Option<serde_json::Value> {
        self.body.as_deref().and_then(|b| serde_json::from_slice(b).ok())
    }
}

/// Status and raw body of an agent reply.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpReply {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// A 200 reply with `value` serialized as the body.
    pub fn json(value: &serde_json::Value) -> Self {
        Self::new(200, value.to_string())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 401 Unauthorized or 403 Forbidden.
    pub fn is_auth_failure(&self) -> bool {
        self.status == 401 || self.status == 403
    }

    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Body as lossy UTF-8, for diagnostics.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Perform one HTTP exchange.
    async fn send(&self, request: HttpRequest) -> Result<HttpReply>;
}

// ---------------------------------------------------------------------------
// reqwest implementation
// ---------------------------------------------------------------------------

/// Transport over a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client with the given connect and per-request timeouts.
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        // Client::builder() only fails when the TLS backend cannot initialise;
        // fall back to a default client rather than refusing to start.
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(3), Duration::from_secs(10))
    }
}

#[async_trait]
impl AgentTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpReply> {
        let url = request.url.to_string();
        let mut builder = match request.method {
            Method::Get => self.client.get(request.url),
            Method::Post => self.client.post(request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let resp = builder.send().await.map_err(|e| ConnectError::Connect {
            url: url.clone(),
            detail: e.to_string(),
        })?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(|e| ConnectError::Connect {
            url,
            detail: e.to_string(),
        })?;
        Ok(HttpReply::new(status, body.to_vec()))
    }
}

// ---------------------------------------------------------------------------
// Scripted implementation
// ---------------------------------------------------------------------------

/// One canned outcome.
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(HttpReply),
    /// Transport-level failure with this detail.
    Fail(String),
}

/// Replays canned outcomes keyed by URL (query and fragment ignored).
///
/// Each URL owns a queue; the last queued outcome repeats once the queue is
/// down to one entry. URLs with nothing queued fail like a refused connection.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, VecDeque<Scripted>>>,
    sent: Mutex<Vec<HttpRequest>>,
    latency: Option<Duration>,
}

fn route_key(url: &Url) -> String {
    let mut key = url.clone();
    key.set_query(None);
    key.set_fragment(None);
    key.to_string()
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every reply by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue a reply for `url`.
    pub fn reply(&self, url: &str, reply: HttpReply) -> &Self {
        self.push(url, Scripted::Reply(reply))
    }

    /// Queue a transport failure for `url`.
    pub fn fail(&self, url: &str, detail: &str) -> &Self {
        self.push(url, Scripted::Fail(detail.to_string()))
    }

    fn push(&self, url: &str, outcome: Scripted) -> &Self {
        let key = Url::parse(url)
            .map(|u| route_key(&u))
            .unwrap_or_else(|_| url.to_string());
        if let Ok(mut routes) = self.routes.lock() {
            routes.entry(key).or_default().push_back(outcome);
        }
        self
    }

    /// Every request sent so far, in order.
    pub fn sent(&self) -> Vec<HttpRequest> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// URLs (without query) of every request sent so far, in order.
    pub fn sent_urls(&self) -> Vec<String> {
        self.sent().iter().map(|r| route_key(&r.url)).collect()
    }

    fn next_outcome(&self, url: &Url) -> Option<Scripted> {
        let mut routes = self.routes.lock().ok()?;
        let queue = routes.get_mut(&route_key(url))?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl AgentTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpReply> {
        let url = request.url.clone();
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(request);
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match self.next_outcome(&url) {
            Some(Scripted::Reply(reply)) => Ok(reply),
            Some(Scripted::Fail(detail)) => Err(ConnectError::Connect {
                url: url.to_string(),
                detail,
            }),
            None => Err(ConnectError::Connect {
                url: url.to_string(),
                detail: "connection refused".to_string(),
            }),
        }
    }
}
