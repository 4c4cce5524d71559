//! # Stage: Connection Context
//!
//! ## Responsibility
//! Own every collaborator one console needs (storage, profiles, transport,
//! host, logout hooks, configuration) and run the startup sequence:
//! resolve → look up the profile → create the session → probe capabilities.
//!
//! ## Guarantees
//! - A [`Connection`] is only handed out after the capability probe resolved,
//!   so no consumer can query before the query path is known
//! - At most one redirect is followed per `connect`
//! - No process-wide state: contexts are independent and can coexist
//! - `connect` never fails; the worst outcome is a dummy session
//!
//! ## NOT Responsible For
//! - Re-connecting on its own (call `connect` again; sessions are replaced)

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use url::Url;

use crate::capability::CapabilityProber;
use crate::config::ConsoleConfig;
use crate::error::Result;
use crate::host::{DetachedHost, HostEnvironment};
use crate::interceptor::LogoutHooks;
use crate::navigation::NavigationContext;
use crate::profile::{ConnectionProfile, ProfileStore};
use crate::resolver::{EndpointResolver, EndpointResult, Resolution};
use crate::session::{ListCapability, Session, SessionFactory};
use crate::storage::{KeyValueStore, MemoryStore, SqliteStore};
use crate::transport::{AgentTransport, ReqwestTransport};

/// A published connection: the session plus what was negotiated for it.
#[derive(Debug, Clone)]
pub struct Connection {
    pub session: Session,
    pub capability: ListCapability,
    /// The location the connection was made from, after any redirect.
    pub location: Url,
    pub profile: Option<ConnectionProfile>,
}

/// Serializable summary of a [`Connection`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionReport {
    pub connected: bool,
    pub url: Option<String>,
    pub connection: Option<String>,
    pub capability: ListCapability,
    pub running: bool,
    pub location: String,
}

impl Connection {
    pub fn is_connected(&self) -> bool {
        !self.session.is_dummy()
    }

    pub fn report(&self) -> ConnectionReport {
        ConnectionReport {
            connected: self.is_connected(),
            url: self.session.url().map(Url::to_string),
            connection: self.profile.as_ref().map(|p| p.name.clone()),
            capability: self.capability,
            running: self.session.is_running(),
            location: self.location.to_string(),
        }
    }
}

/// Explicitly owned connection state for one console.
pub struct ConnectionContext {
    config: ConsoleConfig,
    store: Arc<dyn KeyValueStore>,
    profiles: ProfileStore,
    transport: Arc<dyn AgentTransport>,
    host: Arc<dyn HostEnvironment>,
    hooks: Arc<LogoutHooks>,
    prober: CapabilityProber,
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("config", &self.config)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

impl ConnectionContext {
    pub fn new(
        config: ConsoleConfig,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn AgentTransport>,
        host: Arc<dyn HostEnvironment>,
    ) -> Self {
        Self {
            config,
            profiles: ProfileStore::new(store.clone()),
            store,
            transport,
            host,
            hooks: Arc::new(LogoutHooks::new()),
            prober: CapabilityProber::default(),
        }
    }

    /// Build the collaborators `config` describes: SQLite or in-memory
    /// storage, a reqwest transport with the configured timeouts, and a
    /// detached host that takes injected credentials from the environment.
    pub fn from_config(config: ConsoleConfig) -> Result<Self> {
        let store: Arc<dyn KeyValueStore> = match &config.storage_path {
            Some(path) => Arc::new(SqliteStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        };
        let transport = Arc::new(ReqwestTransport::new(config.connect_timeout(), config.request_timeout()));
        Ok(Self::new(config, store, transport, Arc::new(DetachedHost::from_env())))
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn profiles(&self) -> &ProfileStore {
        &self.profiles
    }

    /// Logout sequence shared by every session this context creates.
    pub fn hooks(&self) -> &Arc<LogoutHooks> {
        &self.hooks
    }

    pub fn resolver(&self) -> EndpointResolver {
        EndpointResolver::new(self.transport.clone(), self.config.candidates.clone())
    }

    pub fn session_factory(&self, nav: NavigationContext) -> SessionFactory {
        SessionFactory::builder(nav)
            .store(self.store.clone())
            .transport(self.transport.clone())
            .host(self.host.clone())
            .hooks(self.hooks.clone())
            .build()
    }

    /// Run the startup sequence for `nav` and publish the connection.
    pub async fn connect(&self, nav: NavigationContext) -> Connection {
        let resolver = self.resolver();
        let mut nav = nav;
        let mut resolution = resolver.resolve(&nav, &self.profiles).await;

        if let Resolution::Redirect { location, .. } = &resolution {
            info!(location = %location, "following connection redirect");
            nav = NavigationContext::new(location.clone(), nav.document_base());
            resolution = resolver.resolve(&nav, &self.profiles).await;
        }

        let (endpoint, profile) = match resolution {
            Resolution::Named(name) => match self.profiles.load(&name) {
                Some(profile) => {
                    self.profiles.add_recent(&name);
                    (EndpointResult::Found(profile.server_url()), Some(profile))
                }
                None => {
                    warn!(connection = %name, "no stored profile with this name");
                    (EndpointResult::NotFound, None)
                }
            },
            Resolution::Found(url) => (EndpointResult::Found(url), None),
            Resolution::Redirect { location, .. } => {
                warn!(location = %location, "redirected twice, giving up");
                (EndpointResult::NotFound, None)
            }
            Resolution::NotFound => (EndpointResult::NotFound, None),
        };

        let session = self.session_factory(nav.clone()).create_session(&endpoint, profile.as_ref());
        let capability = self.prober.probe(&session).await;
        Connection {
            session,
            capability,
            location: nav.location().clone(),
            profile,
        }
    }
}
