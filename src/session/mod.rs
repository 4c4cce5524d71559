//! # Stage: Session
//!
//! ## Responsibility
//! The live binding to one agent endpoint: request execution through the
//! per-session interceptor chain, the session status (last HTTP error,
//! negotiated list capability), and the polling clock.
//!
//! ## Guarantees
//! - A dummy session (no agent) answers every query with "no data" and never
//!   touches the network; `start`/`stop` only flip its running flag
//! - Every live request passes the credential injector, then the
//!   auth-failure interceptor sees the reply
//! - The list capability is recorded once; only `Indeterminate` may later be
//!   upgraded
//! - Sessions are replaced on reconnect, never re-pointed
//!
//! ## NOT Responsible For
//! - Choosing the endpoint or the credentials (see [`factory::SessionFactory`])
//! - Probing capabilities (see `capability`)

pub mod factory;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::error::{ConnectError, Result};
use crate::interceptor::{AuthFailureInterceptor, RequestInterceptor};
use crate::polling::{BatchExecutor, PollingRegistrar, RegistrationHandle, SuccessHandler};
use crate::protocol::{decode_responses, AgentRequest, AgentResponse};
use crate::storage::{KeyValueStore, REQUEST_PARAMS_KEY};
use crate::transport::{AgentTransport, HttpRequest};

pub use factory::{resolve_credentials, CredentialSource, SessionFactory, SessionFactoryBuilder};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Whether the agent offers the optimized batched list operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListCapability {
    #[default]
    Unknown,
    OptimizedAvailable,
    GeneralOnly,
    /// The probe was refused for authorization reasons. Behaves like
    /// `GeneralOnly` but may be upgraded after re-authentication.
    Indeterminate,
}

impl ListCapability {
    /// True only when the optimized path is known to exist.
    pub fn uses_optimized(self) -> bool {
        self == ListCapability::OptimizedAvailable
    }
}

impl std::fmt::Display for ListCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ListCapability::Unknown            => "unknown",
            ListCapability::OptimizedAvailable => "optimized",
            ListCapability::GeneralOnly        => "general",
            ListCapability::Indeterminate      => "indeterminate",
        };
        write!(f, "{s}")
    }
}

/// A failed HTTP exchange, kept for diagnostic display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub url: String,
    /// `None` for transport failures that never produced a status.
    pub status: Option<u16>,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub last_error_response: Option<ErrorRecord>,
    pub list_capability: ListCapability,
}

// ---------------------------------------------------------------------------
// Request parameters
// ---------------------------------------------------------------------------

/// Response-shape parameters sent with every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestParams {
    pub max_depth: u32,
    pub max_collection_size: u32,
    pub ignore_errors: bool,
    pub canonical_naming: bool,
    pub mime_type: String,
}

impl Default for RequestParams {
    fn default() -> Self {
        Self {
            max_depth: 7,
            max_collection_size: 50_000,
            ignore_errors: true,
            canonical_naming: false,
            mime_type: "application/json".to_string(),
        }
    }
}

impl RequestParams {
    /// Read the persisted parameters, writing defaults back when absent or unreadable.
    pub fn load_or_init(store: &dyn KeyValueStore) -> Self {
        let raw = match store.get(REQUEST_PARAMS_KEY) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "cannot read request parameters, using defaults");
                return Self::default();
            }
        };
        if let Some(raw) = raw {
            match serde_json::from_str(&raw) {
                Ok(params) => return params,
                Err(e) => warn!(error = %e, "stored request parameters are corrupt, resetting"),
            }
        }
        let params = Self::default();
        crate::storage::save_json(store, REQUEST_PARAMS_KEY, &params);
        params
    }

    fn apply(&self, url: &mut Url) {
        url.query_pairs_mut()
            .append_pair("maxDepth", &self.max_depth.to_string())
            .append_pair("maxCollectionSize", &self.max_collection_size.to_string())
            .append_pair("ignoreErrors", &self.ignore_errors.to_string())
            .append_pair("canonicalNaming", &self.canonical_naming.to_string())
            .append_pair("mimeType", &self.mime_type);
    }
}

// ---------------------------------------------------------------------------
// Live client
// ---------------------------------------------------------------------------

/// The wire half of a live session.
pub(crate) struct LiveClient {
    pub(crate) url: Url,
    pub(crate) params: RequestParams,
    pub(crate) transport: Arc<dyn AgentTransport>,
    pub(crate) interceptors: Vec<Arc<dyn RequestInterceptor>>,
    pub(crate) auth: Arc<AuthFailureInterceptor>,
    pub(crate) status: Arc<Mutex<SessionStatus>>,
}

impl LiveClient {
    fn record_error(&self, url: &Url, status: Option<u16>, detail: String) {
        if let Ok(mut s) = self.status.lock() {
            s.last_error_response = Some(ErrorRecord {
                url: url.to_string(),
                status,
                detail,
            });
        }
    }

    async fn post(&self, requests: Vec<AgentRequest>) -> Result<Vec<AgentResponse>> {
        let expected = requests.len();
        let mut url = self.url.clone();
        self.params.apply(&mut url);

        let mut request = HttpRequest::post_json(url.clone(), &requests)?;
        for interceptor in &self.interceptors {
            interceptor.before_send(&mut request);
        }

        let reply = match self.transport.send(request).await {
            Ok(reply) => reply,
            Err(e) => {
                self.record_error(&url, None, e.to_string());
                return Err(e);
            }
        };
        if let Some(action) = self.auth.on_reply(url.as_str(), &reply) {
            debug!(?action, status = reply.status, "request rejected by agent");
            return Err(ConnectError::AuthRejected {
                status: reply.status,
                url: self.url.to_string(),
            });
        }
        if !reply.is_success() {
            self.record_error(&url, Some(reply.status), reply.text());
            return Err(ConnectError::Http {
                status: reply.status,
                url: self.url.to_string(),
            });
        }

        let responses = match decode_responses(&reply.body) {
            Ok(responses) => responses,
            Err(e) => {
                self.record_error(&url, Some(reply.status), format!("malformed response: {e}"));
                return Err(e.into());
            }
        };
        if responses.len() != expected {
            warn!(expected, got = responses.len(), url = %self.url, "batch response size mismatch");
        }
        Ok(responses)
    }
}

#[async_trait]
impl BatchExecutor for LiveClient {
    async fn execute(&self, requests: Vec<AgentRequest>) -> Result<Vec<AgentResponse>> {
        self.post(requests).await
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct SessionInner {
    live: Option<Arc<LiveClient>>,
    params: RequestParams,
    status: Arc<Mutex<SessionStatus>>,
    registrar: PollingRegistrar,
}

/// Handle to one agent session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("url", &self.url().map(Url::as_str))
            .field("dummy", &self.is_dummy())
            .field("running", &self.is_running())
            .field("status", &self.status())
            .finish()
    }
}

fn into_value(response: AgentResponse) -> Result<Value> {
    if response.is_success() {
        Ok(response.value)
    } else {
        Err(ConnectError::Remote {
            status: response.status,
            message: response.error.unwrap_or_default(),
        })
    }
}

impl Session {
    /// A session with no agent behind it.
    pub fn dummy(params: RequestParams) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                live: None,
                params,
                status: Arc::new(Mutex::new(SessionStatus::default())),
                registrar: PollingRegistrar::detached(),
            }),
        }
    }

    pub(crate) fn live(client: LiveClient) -> Self {
        let params = client.params.clone();
        let status = client.status.clone();
        let client = Arc::new(client);
        Self {
            inner: Arc::new(SessionInner {
                registrar: PollingRegistrar::new(client.clone()),
                live: Some(client),
                params,
                status,
            }),
        }
    }

    pub fn is_dummy(&self) -> bool {
        self.inner.live.is_none()
    }

    /// Absolute agent URL, `None` for a dummy session.
    pub fn url(&self) -> Option<&Url> {
        self.inner.live.as_ref().map(|c| &c.url)
    }

    pub fn params(&self) -> &RequestParams {
        &self.inner.params
    }

    /// Snapshot of the session status.
    pub fn status(&self) -> SessionStatus {
        self.inner
            .status
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn list_capability(&self) -> ListCapability {
        self.status().list_capability
    }

    /// Record the probed capability. Returns `false` when the value was
    /// already settled and is not an upgrade from `Indeterminate`.
    pub fn record_capability(&self, capability: ListCapability) -> bool {
        let Ok(mut status) = self.inner.status.lock() else {
            return false;
        };
        let settable = match status.list_capability {
            ListCapability::Unknown => true,
            ListCapability::Indeterminate => capability != ListCapability::Unknown,
            _ => false,
        };
        if settable {
            status.list_capability = capability;
        }
        settable
    }

    /// True once a 401/403 has been handled on this session.
    pub fn auth_failed(&self) -> bool {
        self.inner
            .live
            .as_ref()
            .map(|c| c.auth.has_fired())
            .unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Send one request. `Ok(None)` on a dummy session.
    pub async fn request(&self, request: AgentRequest) -> Result<Option<AgentResponse>> {
        let Some(client) = &self.inner.live else {
            return Ok(None);
        };
        Ok(client.post(vec![request]).await?.into_iter().next())
    }

    /// Send several requests in one HTTP call. Empty on a dummy session.
    pub async fn request_batch(&self, requests: Vec<AgentRequest>) -> Result<Vec<AgentResponse>> {
        match &self.inner.live {
            Some(client) if !requests.is_empty() => client.post(requests).await,
            _ => Ok(Vec::new()),
        }
    }

    async fn value_of(&self, request: AgentRequest) -> Result<Option<Value>> {
        match self.request(request).await? {
            Some(response) => into_value(response).map(Some),
            None => Ok(None),
        }
    }

    /// Schema below `path` (`None` for the whole tree).
    pub async fn list(&self, path: Option<&str>) -> Result<Option<Value>> {
        self.value_of(AgentRequest::list(path.map(str::to_string))).await
    }

    /// MBean names matching `pattern`.
    pub async fn search(&self, pattern: &str) -> Result<Vec<String>> {
        match self.value_of(AgentRequest::search(pattern)).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    pub async fn get_attribute(&self, mbean: &str, attribute: &str) -> Result<Option<Value>> {
        self.value_of(AgentRequest::read(mbean, attribute)).await
    }

    /// Write an attribute; returns the previous value.
    pub async fn set_attribute(&self, mbean: &str, attribute: &str, value: Value) -> Result<Option<Value>> {
        self.value_of(AgentRequest::write(mbean, attribute, value)).await
    }

    pub async fn execute(&self, mbean: &str, operation: &str, arguments: Vec<Value>) -> Result<Option<Value>> {
        self.value_of(AgentRequest::exec(mbean, operation, arguments)).await
    }

    pub async fn version(&self) -> Result<Option<Value>> {
        self.value_of(AgentRequest::version()).await
    }

    /// Process id of the remote JVM as `pid:<n>`, from the runtime name `<pid>@<host>`.
    pub async fn process_id(&self) -> Result<Option<String>> {
        let name = self.get_attribute("java.lang:type=Runtime", "Name").await?;
        Ok(name
            .as_ref()
            .and_then(Value::as_str)
            .and_then(|n| n.split('@').next())
            .filter(|pid| !pid.is_empty() && pid.chars().all(|c| c.is_ascii_digit()))
            .map(|pid| format!("pid:{pid}")))
    }

    // -----------------------------------------------------------------------
    // Polling
    // -----------------------------------------------------------------------

    pub fn start(&self, interval: Duration) {
        self.inner.registrar.start(interval);
    }

    pub fn stop(&self) {
        self.inner.registrar.stop();
    }

    pub fn is_running(&self) -> bool {
        self.inner.registrar.is_running()
    }

    pub fn update_interval(&self) -> Duration {
        self.inner.registrar.interval()
    }

    pub fn set_update_interval(&self, interval: Duration) {
        self.inner.registrar.set_interval(interval);
    }

    pub fn register<F>(&self, request: AgentRequest, handler: F) -> RegistrationHandle
    where
        F: Fn(&AgentResponse) + Send + Sync + 'static,
    {
        self.inner.registrar.register(request, handler)
    }

    pub fn register_all(&self, request: AgentRequest, handlers: Vec<SuccessHandler>) -> RegistrationHandle {
        self.inner.registrar.register_all(request, handlers)
    }

    pub fn unregister(&self, handle: RegistrationHandle) -> bool {
        self.inner.registrar.unregister(handle)
    }

    pub fn jobs(&self) -> Vec<RegistrationHandle> {
        self.inner.registrar.jobs()
    }

    /// Run one polling tick now.
    pub async fn poll_once(&self) -> Result<usize> {
        self.inner.registrar.poll_once().await
    }
}
