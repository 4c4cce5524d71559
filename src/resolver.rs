//! # Stage: Endpoint Resolution
//!
//! ## Responsibility
//! Decide where the agent lives before anything else starts:
//! 1. an embedded connection request is turned into a stored profile and a
//!    redirect to `?con=<name>`
//! 2. a named profile short-circuits resolution (the profile is authoritative)
//! 3. otherwise the candidate paths are probed one at a time, last-declared first
//!
//! ## Guarantees
//! - Discovery is sequential: one in-flight probe, stop on the first acceptance
//! - For fixed candidates and fixed replies the outcome and probe order are
//!   always the same
//! - Nothing here returns an error; failed probes are logged and skipped
//! - A cancelled scan resolves to [`EndpointResult::NotFound`] before the next probe
//!
//! ## NOT Responsible For
//! - Building the session (see `session::SessionFactory`)
//! - Verifying that a 401/403 candidate really is an agent. Access-gated
//!   candidates are accepted, which can mistake an unrelated protected
//!   endpoint for the agent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::navigation::NavigationContext;
use crate::profile::{ConnectionProfile, ProfileStore};
use crate::transport::{AgentTransport, HttpRequest};

/// Paths probed during discovery, most specific first. Probed in reverse.
pub const DEFAULT_CANDIDATES: [&str; 3] = ["/hawtio/jolokia", "/jolokia", "jolokia"];

/// Outcome of endpoint resolution as seen by the session factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointResult {
    /// Agent endpoint, possibly relative to the console's document base.
    Found(String),
    NotFound,
}

impl EndpointResult {
    pub fn is_found(&self) -> bool {
        matches!(self, EndpointResult::Found(_))
    }
}

/// Full outcome of one resolution pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// An embedded connection request was stored; navigate to `location` and resolve again.
    Redirect {
        location: Url,
        profile: ConnectionProfile,
    },
    /// The location names a profile; no probing was done.
    Named(String),
    /// Discovery accepted a candidate.
    Found(String),
    /// Discovery exhausted every candidate.
    NotFound,
}

impl Resolution {
    /// The discovered endpoint, if this pass discovered one.
    pub fn endpoint(&self) -> EndpointResult {
        match self {
            Resolution::Found(url) => EndpointResult::Found(url.clone()),
            _ => EndpointResult::NotFound,
        }
    }
}

/// How a single candidate answered.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CandidateOutcome {
    Agent(String),
    Gated(u16),
    Rejected(String),
}

/// Resolves the agent endpoint for one navigation context.
pub struct EndpointResolver {
    transport: Arc<dyn AgentTransport>,
    candidates: Vec<String>,
    cancelled: AtomicBool,
}

impl std::fmt::Debug for EndpointResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointResolver")
            .field("candidates", &self.candidates)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl EndpointResolver {
    pub fn new(transport: Arc<dyn AgentTransport>, candidates: Vec<String>) -> Self {
        Self {
            transport,
            candidates,
            cancelled: AtomicBool::new(false),
        }
    }

    /// A resolver over [`DEFAULT_CANDIDATES`].
    pub fn with_default_candidates(transport: Arc<dyn AgentTransport>) -> Self {
        Self::new(transport, DEFAULT_CANDIDATES.iter().map(|c| c.to_string()).collect())
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    /// Stop an in-progress scan before its next probe.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Run one resolution pass.
    pub async fn resolve(&self, nav: &NavigationContext, profiles: &ProfileStore) -> Resolution {
        if let Some(embedded) = nav.embedded_connection() {
            let profile = embedded.to_profile();
            profiles.save(profile.clone());
            let location = nav.canonical_location(&embedded.name);
            info!(connection = %embedded.name, location = %location, "stored embedded connection request, redirecting");
            return Resolution::Redirect { location, profile };
        }

        if let Some(name) = nav.connection_name() {
            debug!(connection = %name, "connection named, not discovering");
            return Resolution::Named(name);
        }

        match self.discover(nav).await {
            EndpointResult::Found(url) => Resolution::Found(url),
            EndpointResult::NotFound => Resolution::NotFound,
        }
    }

    /// Probe the candidates, last-declared first, stopping at the first acceptance.
    pub async fn discover(&self, nav: &NavigationContext) -> EndpointResult {
        for candidate in self.candidates.iter().rev() {
            if self.is_cancelled() {
                info!("endpoint discovery cancelled");
                return EndpointResult::NotFound;
            }
            let url = match nav.resolve_endpoint_url(candidate, false) {
                Ok(url) => url,
                Err(e) => {
                    warn!(candidate = %candidate, error = %e, "skipping unresolvable candidate");
                    continue;
                }
            };
            debug!(candidate = %candidate, url = %url, "trying candidate");
            match self.check(url.clone()).await {
                CandidateOutcome::Agent(version) => {
                    info!(candidate = %candidate, url = %url, agent = %version, "found agent");
                    return EndpointResult::Found(candidate.clone());
                }
                CandidateOutcome::Gated(status) => {
                    warn!(
                        candidate = %candidate,
                        url = %url,
                        status,
                        "candidate is access-gated, assuming it is the agent (unverified)"
                    );
                    return EndpointResult::Found(candidate.clone());
                }
                CandidateOutcome::Rejected(reason) => {
                    debug!(candidate = %candidate, url = %url, reason = %reason, "candidate rejected");
                }
            }
        }
        info!("no agent found at any candidate");
        EndpointResult::NotFound
    }

    async fn check(&self, url: Url) -> CandidateOutcome {
        let reply = match self.transport.send(HttpRequest::get(url)).await {
            Ok(reply) => reply,
            Err(e) => return CandidateOutcome::Rejected(e.to_string()),
        };
        if reply.is_auth_failure() {
            return CandidateOutcome::Gated(reply.status);
        }
        if reply.status != 200 {
            return CandidateOutcome::Rejected(format!("HTTP {}", reply.status));
        }
        match reply.parse::<Value>() {
            Ok(body) => match body.get("value").and_then(|v| v.get("agent")) {
                Some(agent) => CandidateOutcome::Agent(match agent {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                }),
                None => CandidateOutcome::Rejected("no agent in response".to_string()),
            },
            Err(e) => CandidateOutcome::Rejected(format!("malformed body: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::transport::{HttpReply, ScriptedTransport};
    use serde_json::json;

    const PAGE: &str = "http://console:8080/app/";

    fn nav() -> NavigationContext {
        NavigationContext::parse(PAGE, "/app/").unwrap()
    }

    fn agent_reply() -> HttpReply {
        HttpReply::json(&json!({"value": {"agent": "1.7.2", "protocol": "7.2"}, "status": 200}))
    }

    fn resolver(t: &Arc<ScriptedTransport>) -> EndpointResolver {
        EndpointResolver::with_default_candidates(t.clone())
    }

    fn profiles() -> ProfileStore {
        ProfileStore::new(Arc::new(MemoryStore::new()))
    }

    // -----------------------------------------------------------------------
    // Discovery order and acceptance
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn probes_in_reverse_and_stops_at_first_agent() {
        let t = Arc::new(ScriptedTransport::new());
        t.reply("http://console:8080/jolokia", agent_reply());
        t.reply("http://console:8080/hawtio/jolokia", agent_reply());

        let result = resolver(&t).discover(&nav()).await;
        assert_eq!(result, EndpointResult::Found("/jolokia".into()));
        assert_eq!(
            t.sent_urls(),
            vec!["http://console:8080/app/jolokia", "http://console:8080/jolokia"]
        );
    }

    #[tokio::test]
    async fn discovery_is_deterministic() {
        let t = Arc::new(ScriptedTransport::new());
        t.reply("http://console:8080/app/jolokia", HttpReply::new(404, "nope"));
        t.reply("http://console:8080/hawtio/jolokia", agent_reply());
        let r = resolver(&t);

        let first = r.discover(&nav()).await;
        let first_order = t.sent_urls();
        let second = r.discover(&nav()).await;
        assert_eq!(first, second);
        let all = t.sent_urls();
        assert_eq!(&all[first_order.len()..], first_order.as_slice());
    }

    #[tokio::test]
    async fn gated_candidate_is_accepted() {
        let t = Arc::new(ScriptedTransport::new());
        t.reply("http://console:8080/app/jolokia", HttpReply::new(403, ""));
        assert_eq!(
            resolver(&t).discover(&nav()).await,
            EndpointResult::Found("jolokia".into())
        );
        assert_eq!(t.sent().len(), 1);
    }

    #[tokio::test]
    async fn malformed_and_agentless_bodies_are_skipped() {
        let t = Arc::new(ScriptedTransport::new());
        t.reply("http://console:8080/app/jolokia", HttpReply::new(200, "<html>"));
        t.reply("http://console:8080/jolokia", HttpReply::json(&json!({"value": {}})));
        t.fail("http://console:8080/hawtio/jolokia", "timeout");
        assert_eq!(resolver(&t).discover(&nav()).await, EndpointResult::NotFound);
        assert_eq!(t.sent().len(), 3);
    }

    #[tokio::test]
    async fn cancelled_scan_sends_nothing() {
        let t = Arc::new(ScriptedTransport::new());
        t.reply("http://console:8080/app/jolokia", agent_reply());
        let r = resolver(&t);
        r.cancel();
        assert_eq!(r.discover(&nav()).await, EndpointResult::NotFound);
        assert!(t.sent().is_empty());
    }

    // -----------------------------------------------------------------------
    // Named and embedded connections
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn named_connection_skips_discovery() {
        let t = Arc::new(ScriptedTransport::new());
        let nav = nav().with_query("con", "prod");
        let resolution = resolver(&t).resolve(&nav, &profiles()).await;
        assert_eq!(resolution, Resolution::Named("prod".into()));
        assert_eq!(resolution.endpoint(), EndpointResult::NotFound);
        assert!(t.sent().is_empty());
    }

    #[tokio::test]
    async fn embedded_connection_is_stored_and_redirected() {
        let t = Arc::new(ScriptedTransport::new());
        let store = profiles();
        let nav = nav()
            .with_query("jolokiaUrl", "http://h:1234/x")
            .with_query("title", "T")
            .with_query("token", "abc");

        let resolution = resolver(&t).resolve(&nav, &store).await;
        let (location, profile) = match resolution {
            Resolution::Redirect { location, profile } => (location, profile),
            other => panic!("expected redirect, got {other:?}"),
        };
        assert_eq!(location.query(), Some("con=T"));
        assert!(!location.as_str().contains("jolokiaUrl"));
        assert!(!location.as_str().contains("abc"));

        let stored = store.load("T").unwrap();
        assert_eq!(stored, profile);
        assert_eq!((stored.scheme.as_str(), stored.host.as_str()), ("http", "h"));
        assert_eq!(stored.port, Some(1234));
        assert_eq!(stored.path, "x");
        assert_eq!(stored.token.as_deref(), Some("abc"));
        assert!(t.sent().is_empty());
    }

    // -----------------------------------------------------------------------
    // Real HTTP
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn discovers_agent_over_http() {
        use crate::transport::ReqwestTransport;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jolokia"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"value": {"agent": "2.0.0"}, "status": 200})),
            )
            .mount(&server)
            .await;

        let nav = NavigationContext::parse(&format!("{}/app/", server.uri()), "/app/").unwrap();
        let r = EndpointResolver::with_default_candidates(Arc::new(ReqwestTransport::default()));
        assert_eq!(r.discover(&nav).await, EndpointResult::Found("/jolokia".into()));
    }
}
