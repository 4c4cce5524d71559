//! Session construction.
//!
//! Turns an endpoint plus an optional profile into a [`Session`]: absolute URL,
//! one credential source out of four, the per-session interceptors, request
//! parameters from storage, and the persisted polling interval.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::{LiveClient, RequestParams, Session, SessionStatus};
use crate::host::{DetachedHost, HostEnvironment};
use crate::interceptor::{AuthFailureInterceptor, CredentialInjector, Credentials, LogoutHooks, RequestInterceptor};
use crate::navigation::NavigationContext;
use crate::profile::ConnectionProfile;
use crate::resolver::EndpointResult;
use crate::storage::{self, KeyValueStore, MemoryStore, UPDATE_RATE_KEY};
use crate::transport::{AgentTransport, ReqwestTransport};

/// Where the session's credentials came from, highest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    ProfileToken,
    ProfileBasic,
    Injected,
    QueryParams,
}

impl std::fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialSource::ProfileToken => write!(f, "profile token"),
            CredentialSource::ProfileBasic => write!(f, "profile username/password"),
            CredentialSource::Injected     => write!(f, "injected credentials"),
            CredentialSource::QueryParams  => write!(f, "query parameters"),
        }
    }
}

/// Pick the credentials for a session; the first source that yields wins.
///
/// Order: profile token, profile username/password, host-injected
/// credentials, `_user`/`_pwd` query parameters.
pub fn resolve_credentials(
    profile: Option<&ConnectionProfile>,
    host: &dyn HostEnvironment,
    nav: &NavigationContext,
) -> Option<(Credentials, CredentialSource)> {
    if let Some(creds) = profile.and_then(ConnectionProfile::credentials) {
        let source = match creds {
            Credentials::Bearer(_) => CredentialSource::ProfileToken,
            Credentials::Basic { .. } => CredentialSource::ProfileBasic,
        };
        return Some((creds, source));
    }
    if let Some(details) = host.injected_credentials().filter(|d| d.is_complete()) {
        return Some((
            Credentials::basic(details.username, details.password),
            CredentialSource::Injected,
        ));
    }
    nav.query_credentials()
        .map(|d| (Credentials::basic(d.username, d.password), CredentialSource::QueryParams))
}

/// Persisted polling interval in milliseconds, if positive.
fn stored_update_rate(store: &dyn KeyValueStore) -> Option<Duration> {
    let rate = match storage::load_json::<Value>(store, UPDATE_RATE_KEY)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }?;
    (rate > 0).then(|| Duration::from_millis(rate as u64))
}

/// Builds sessions for one navigation context.
///
/// Use [`SessionFactory::builder`]; every collaborator has a default.
pub struct SessionFactory {
    nav: NavigationContext,
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn AgentTransport>,
    host: Arc<dyn HostEnvironment>,
    hooks: Arc<LogoutHooks>,
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("location", &self.nav.location().as_str())
            .finish_non_exhaustive()
    }
}

impl SessionFactory {
    pub fn builder(nav: NavigationContext) -> SessionFactoryBuilder {
        SessionFactoryBuilder::new(nav)
    }

    /// Build a session for `endpoint`.
    ///
    /// `NotFound` (or an endpoint that cannot be made absolute) yields a
    /// dummy session. Never fails and never touches the network, except for
    /// starting the polling clock when a positive `updateRate` is stored.
    pub fn create_session(&self, endpoint: &EndpointResult, profile: Option<&ConnectionProfile>) -> Session {
        let params = RequestParams::load_or_init(self.store.as_ref());

        let endpoint = match endpoint {
            EndpointResult::Found(endpoint) => endpoint,
            EndpointResult::NotFound => {
                info!("no agent endpoint, using a dummy session");
                return Session::dummy(params);
            }
        };

        let authoritative = profile.map(ConnectionProfile::has_explicit_url).unwrap_or(false);
        let url = match self.nav.resolve_endpoint_url(endpoint, !authoritative) {
            Ok(url) => url,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "cannot build agent URL, using a dummy session");
                return Session::dummy(params);
            }
        };

        let mut interceptors: Vec<Arc<dyn RequestInterceptor>> = Vec::new();
        match resolve_credentials(profile, self.host.as_ref(), &self.nav) {
            Some((credentials, source)) => {
                debug!(%source, scheme = credentials.scheme(), "installing authorization header");
                interceptors.push(Arc::new(CredentialInjector::new(credentials)));
            }
            None => debug!("no credentials, not setting an authorization header"),
        }

        let client = LiveClient {
            url,
            params,
            transport: self.transport.clone(),
            interceptors,
            auth: Arc::new(AuthFailureInterceptor::new(self.host.clone(), self.hooks.clone())),
            status: Arc::new(Mutex::new(SessionStatus::default())),
        };
        info!(url = %client.url, profile = profile.map(|p| p.name.as_str()), "session created");
        let session = Session::live(client);

        if let Some(rate) = stored_update_rate(self.store.as_ref()) {
            debug!(interval_ms = rate.as_millis() as u64, "starting poll clock from stored update rate");
            session.start(rate);
        }
        session
    }
}

/// Builder for [`SessionFactory`].
///
/// # Example
/// ```rust,ignore
/// let factory = SessionFactory::builder(nav)
///     .store(Arc::clone(&store))
///     .transport(Arc::new(ReqwestTransport::default()))
///     .build();
/// ```
pub struct SessionFactoryBuilder {
    nav: NavigationContext,
    store: Option<Arc<dyn KeyValueStore>>,
    transport: Option<Arc<dyn AgentTransport>>,
    host: Option<Arc<dyn HostEnvironment>>,
    hooks: Option<Arc<LogoutHooks>>,
}

impl SessionFactoryBuilder {
    pub fn new(nav: NavigationContext) -> Self {
        Self {
            nav,
            store: None,
            transport: None,
            host: None,
            hooks: None,
        }
    }

    /// Durable storage for request parameters and the update rate.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn AgentTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn host(mut self, host: Arc<dyn HostEnvironment>) -> Self {
        self.host = Some(host);
        self
    }

    /// Logout sequence run on the first 401/403 of each session.
    pub fn hooks(mut self, hooks: Arc<LogoutHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn build(self) -> SessionFactory {
        SessionFactory {
            nav: self.nav,
            store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(ReqwestTransport::default())),
            host: self.host.unwrap_or_else(|| Arc::new(DetachedHost::new())),
            hooks: self.hooks.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::UserDetails;
    use crate::protocol::AgentRequest;
    use crate::transport::{HttpReply, ScriptedTransport};
    use serde_json::json;

    const PAGE: &str = "http://console:8080/hawtio/";

    fn nav() -> NavigationContext {
        NavigationContext::parse(PAGE, "/hawtio/").unwrap()
    }

    fn factory(t: &Arc<ScriptedTransport>, store: Arc<MemoryStore>) -> SessionFactory {
        SessionFactory::builder(nav()).store(store).transport(t.clone()).build()
    }

    fn agent_ok() -> HttpReply {
        HttpReply::json(&json!([{"value": {"agent": "1.7.2"}, "status": 200}]))
    }

    // -----------------------------------------------------------------------
    // URL construction
    // -----------------------------------------------------------------------

    #[test]
    fn not_found_gives_dummy() {
        let t = Arc::new(ScriptedTransport::new());
        let s = factory(&t, Arc::new(MemoryStore::new())).create_session(&EndpointResult::NotFound, None);
        assert!(s.is_dummy());
    }

    #[test]
    fn relative_endpoint_is_made_absolute() {
        let t = Arc::new(ScriptedTransport::new());
        let f = factory(&t, Arc::new(MemoryStore::new()));
        let s = f.create_session(&EndpointResult::Found("jolokia".into()), None);
        assert_eq!(s.url().unwrap().as_str(), "http://console:8080/hawtio/jolokia");
        let s = f.create_session(&EndpointResult::Found("/jolokia".into()), None);
        assert_eq!(s.url().unwrap().as_str(), "http://console:8080/jolokia");
    }

    #[test]
    fn explicit_profile_url_keeps_its_own_port() {
        let t = Arc::new(ScriptedTransport::new());
        let f = factory(&t, Arc::new(MemoryStore::new()));
        let mut profile = ConnectionProfile::new("remote");
        profile.jolokia_url = Some("http://remote/jolokia".into());
        let s = f.create_session(&EndpointResult::Found(profile.server_url()), Some(&profile));
        assert_eq!(s.url().unwrap().as_str(), "http://remote/jolokia");

        let mut implicit = ConnectionProfile::new("implicit");
        implicit.host = "remote".into();
        implicit.path = "jolokia".into();
        let s = f.create_session(&EndpointResult::Found(implicit.server_url()), Some(&implicit));
        assert_eq!(s.url().unwrap().as_str(), "http://remote:8080/jolokia");
    }

    #[rstest::rstest]
    #[case("http", 80, "http://remote/jolokia")]
    #[case("https", 443, "https://remote/jolokia")]
    #[case("http", 8778, "http://remote:8778/jolokia")]
    fn profile_default_port_is_not_overridden_by_page(
        #[case] scheme: &str,
        #[case] port: u16,
        #[case] expected: &str,
    ) {
        let t = Arc::new(ScriptedTransport::new());
        let f = factory(&t, Arc::new(MemoryStore::new()));
        let mut profile = ConnectionProfile::new("remote");
        profile.scheme = scheme.into();
        profile.host = "remote".into();
        profile.port = Some(port);
        profile.path = "jolokia".into();

        let s = f.create_session(&EndpointResult::Found(profile.server_url()), Some(&profile));
        let url = s.url().unwrap();
        assert_eq!(url.as_str(), expected);
        assert_eq!(url.port_or_known_default(), Some(port));
    }

    // -----------------------------------------------------------------------
    // Credentials
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn token_header_sent_on_requests() {
        let t = Arc::new(ScriptedTransport::new());
        t.reply("http://console:8080/hawtio/jolokia", agent_ok());
        let profile = ConnectionProfile::new("p").with_token("abc");
        let s = factory(&t, Arc::new(MemoryStore::new()))
            .create_session(&EndpointResult::Found("jolokia".into()), Some(&profile));
        s.request(AgentRequest::version()).await.unwrap();
        assert_eq!(t.sent()[0].header("Authorization"), Some("Bearer abc"));
    }

    #[tokio::test]
    async fn no_credentials_no_header() {
        let t = Arc::new(ScriptedTransport::new());
        t.reply("http://console:8080/hawtio/jolokia", agent_ok());
        let s = factory(&t, Arc::new(MemoryStore::new()))
            .create_session(&EndpointResult::Found("jolokia".into()), None);
        s.request(AgentRequest::version()).await.unwrap();
        assert_eq!(t.sent()[0].header("Authorization"), None);
    }

    #[test]
    fn injected_beats_query_params() {
        let host = DetachedHost::with_credentials(UserDetails::new("opener", "pw"));
        let nav = nav().with_query("_user", "q").with_query("_pwd", "qpw");
        let (creds, source) = resolve_credentials(None, &host, &nav).unwrap();
        assert_eq!(source, CredentialSource::Injected);
        assert_eq!(creds, Credentials::basic("opener", "pw"));
    }

    // -----------------------------------------------------------------------
    // Request parameters and update rate
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn request_params_ride_on_the_query() {
        let t = Arc::new(ScriptedTransport::new());
        t.reply("http://console:8080/hawtio/jolokia", agent_ok());
        let s = factory(&t, Arc::new(MemoryStore::new()))
            .create_session(&EndpointResult::Found("jolokia".into()), None);
        s.version().await.unwrap();
        let sent = &t.sent()[0];
        assert!(sent.url.query().unwrap().contains("maxDepth=7"));
        assert_eq!(sent.json_body(), Some(json!([{"type": "version"}])));
    }

    #[tokio::test]
    async fn positive_update_rate_starts_polling() {
        let store = Arc::new(MemoryStore::new());
        store.set(UPDATE_RATE_KEY, "5000").unwrap();
        let t = Arc::new(ScriptedTransport::new());
        let s = factory(&t, store).create_session(&EndpointResult::Found("jolokia".into()), None);
        assert!(s.is_running());
        assert_eq!(s.update_interval(), Duration::from_millis(5000));
        s.stop();
    }

    #[test]
    fn zero_or_garbage_update_rate_leaves_session_stopped() {
        for raw in ["0", "-5", "\"fast\"", "{oops"] {
            let store = Arc::new(MemoryStore::new());
            store.set(UPDATE_RATE_KEY, raw).unwrap();
            let t = Arc::new(ScriptedTransport::new());
            let s = factory(&t, store).create_session(&EndpointResult::Found("jolokia".into()), None);
            assert!(!s.is_running(), "rate {raw} should not start polling");
        }
    }
}
