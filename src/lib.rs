//! Connection layer for a Jolokia-backed management console.
//!
//! Startup runs in a fixed order: [`resolver`] finds the agent (or follows a
//! URL-embedded connection request), [`session::SessionFactory`] builds an
//! authenticated session, [`capability`] probes it once, and only then does
//! [`context::ConnectionContext`] publish the connection. Live views poll
//! through the session's [`polling`] registrar.

pub mod capability;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod host;
pub mod interceptor;
pub mod logging;
pub mod navigation;
pub mod polling;
pub mod profile;
pub mod protocol;
pub mod resolver;
pub mod session;
pub mod storage;
pub mod transport;

pub use capability::CapabilityProber;
pub use config::ConsoleConfig;
pub use context::{Connection, ConnectionContext, ConnectionReport};
pub use error::{ConnectError, Result};
pub use host::{DetachedHost, HostEnvironment, UserDetails};
pub use interceptor::{Credentials, LogoutHooks};
pub use navigation::NavigationContext;
pub use polling::{PollingRegistrar, RegistrationHandle};
pub use profile::{ConnectionProfile, ProfileStore};
pub use protocol::{AgentRequest, AgentResponse};
pub use resolver::{EndpointResolver, EndpointResult, Resolution};
pub use session::{ListCapability, RequestParams, Session, SessionFactory, SessionStatus};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore};
pub use transport::{AgentTransport, ReqwestTransport, ScriptedTransport};
