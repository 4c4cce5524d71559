//! # Connection Profiles
//!
//! ## Responsibility
//! Named, persisted sets of connection parameters, and the store that keeps
//! them as one `name → profile` map in durable storage. A profile is enough to
//! rebuild the agent URL ([`ConnectionProfile::server_url`]) and to pick the
//! credentials for the session ([`ConnectionProfile::credentials`]).
//!
//! ## Guarantees
//! - Every `load*` re-reads storage; there is no cache to go stale
//! - Never fails towards the caller: corrupt or missing storage reads as empty
//! - Profiles are replaced whole, never patched field by field
//! - Map keys and `profile.name` always agree
//!
//! ## NOT Responsible For
//! - Choosing which profile is active (that is the navigation context)
//! - Encrypting stored passwords

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::interceptor::Credentials;
use crate::storage::{self, KeyValueStore, CONNECTIONS_KEY, RECENT_CONNECTIONS_KEY};

/// Maximum number of names kept in the recent-connections list.
pub const MAX_RECENT_CONNECTIONS: usize = 10;

fn default_scheme() -> String {
    "http".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

// ---------------------------------------------------------------------------
// ConnectionProfile
// ---------------------------------------------------------------------------

/// How to reach and authenticate to one agent.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    pub name: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub use_proxy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Full agent URL. When set, its components are authoritative.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jolokia_url: Option<String>,
    /// Parameters merged verbatim from a connection request.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl std::fmt::Debug for ConnectionProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionProfile")
            .field("name", &self.name)
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("use_proxy", &self.use_proxy)
            .field("user_name", &self.user_name)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("jolokia_url", &self.jolokia_url)
            .field("extra", &self.extra)
            .finish()
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl ConnectionProfile {
    /// A profile for `http://localhost/` named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scheme: default_scheme(),
            host: default_host(),
            port: None,
            path: String::new(),
            use_proxy: false,
            user_name: None,
            password: None,
            token: None,
            jolokia_url: None,
            extra: BTreeMap::new(),
        }
    }

    /// Build a profile from a full agent URL, splitting it into components.
    pub fn from_url(name: impl Into<String>, url: &Url) -> Self {
        Self {
            scheme: url.scheme().to_string(),
            host: url.host_str().unwrap_or("localhost").to_string(),
            port: url.port(),
            path: url.path().trim_start_matches('/').to_string(),
            ..Self::new(name)
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user_name = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Assign one named parameter, the way an incoming connection request does.
    ///
    /// Known keys map onto typed fields; anything else lands in `extra`.
    /// Unparseable values for typed fields are ignored.
    pub fn apply_param(&mut self, key: &str, value: &str) {
        match key {
            "name" => self.name = value.to_string(),
            "scheme" => self.scheme = value.to_string(),
            "host" => self.host = value.to_string(),
            "port" => match value.parse() {
                Ok(port) => self.port = Some(port),
                Err(_) => debug!(value, "ignoring non-numeric port parameter"),
            },
            "path" => self.path = value.trim_start_matches('/').to_string(),
            "useProxy" => self.use_proxy = matches!(value, "true" | "1"),
            "userName" => self.user_name = Some(value.to_string()),
            "password" => self.password = Some(value.to_string()),
            "token" => self.token = Some(value.to_string()),
            "jolokiaUrl" => self.jolokia_url = Some(value.to_string()),
            other => {
                self.extra.insert(other.to_string(), Value::String(value.to_string()));
            }
        }
    }

    /// Credentials for this profile. A token always beats username/password.
    pub fn credentials(&self) -> Option<Credentials> {
        if let Some(token) = non_blank(&self.token) {
            return Some(Credentials::Bearer(token.to_string()));
        }
        match (non_blank(&self.user_name), self.password.as_deref()) {
            (Some(user), Some(password)) if !password.is_empty() => {
                Some(Credentials::basic(user, password))
            }
            _ => None,
        }
    }

    /// True when a full agent URL was supplied explicitly.
    pub fn has_explicit_url(&self) -> bool {
        non_blank(&self.jolokia_url).is_some()
    }

    /// The agent URL this profile points at.
    ///
    /// An explicit `jolokiaUrl` wins; otherwise `scheme://host[:port]/path`.
    /// With `useProxy` the result is routed through the console's own proxy
    /// as the relative path `proxy/<scheme>/<host>/<port>/<path>`.
    pub fn server_url(&self) -> String {
        let direct = match non_blank(&self.jolokia_url) {
            Some(url) => url.to_string(),
            None => {
                let mut url = format!("{}://{}", self.scheme, self.host);
                if let Some(port) = self.port {
                    url.push_str(&format!(":{port}"));
                }
                let path = self.path.trim_start_matches('/');
                if !path.is_empty() {
                    url.push('/');
                    url.push_str(path);
                }
                url
            }
        };
        if !self.use_proxy {
            return direct;
        }
        match Url::parse(&direct) {
            Ok(url) => {
                let port = url.port_or_known_default().unwrap_or(80);
                format!(
                    "proxy/{}/{}/{}/{}",
                    url.scheme(),
                    url.host_str().unwrap_or("localhost"),
                    port,
                    url.path().trim_start_matches('/')
                )
            }
            Err(e) => {
                warn!(profile = %self.name, error = %e, "cannot proxy an unparseable agent URL");
                direct
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ProfileStore
// ---------------------------------------------------------------------------

/// Persisted `name → ConnectionProfile` map plus the recent-connections list.
#[derive(Clone)]
pub struct ProfileStore {
    store: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for ProfileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileStore").finish_non_exhaustive()
    }
}

impl ProfileStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Every stored profile. Entries that no longer parse are skipped.
    pub fn load_all(&self) -> BTreeMap<String, ConnectionProfile> {
        let raw: BTreeMap<String, Value> =
            storage::load_json(self.store.as_ref(), CONNECTIONS_KEY).unwrap_or_default();
        raw.into_iter()
            .filter_map(|(name, value)| match serde_json::from_value::<ConnectionProfile>(value) {
                Ok(mut profile) => {
                    profile.name = name.clone();
                    Some((name, profile))
                }
                Err(e) => {
                    warn!(profile = %name, error = %e, "dropping unreadable connection profile");
                    None
                }
            })
            .collect()
    }

    /// Replace the whole map.
    pub fn save_all(&self, profiles: &BTreeMap<String, ConnectionProfile>) {
        storage::save_json(self.store.as_ref(), CONNECTIONS_KEY, profiles);
    }

    pub fn load(&self, name: &str) -> Option<ConnectionProfile> {
        self.load_all().remove(name)
    }

    /// Insert or replace the profile stored under `profile.name`.
    pub fn save(&self, profile: ConnectionProfile) {
        let mut all = self.load_all();
        debug!(profile = %profile.name, "saving connection profile");
        all.insert(profile.name.clone(), profile);
        self.save_all(&all);
    }

    /// Remove `name`. Returns `true` when a profile was removed.
    pub fn remove(&self, name: &str) -> bool {
        let mut all = self.load_all();
        let removed = all.remove(name).is_some();
        if removed {
            self.save_all(&all);
            self.remove_recent(name);
        }
        removed
    }

    // -----------------------------------------------------------------------
    // Recent connections
    // -----------------------------------------------------------------------

    /// Recently used connection names, most recent first.
    pub fn recent(&self) -> Vec<String> {
        storage::load_json(self.store.as_ref(), RECENT_CONNECTIONS_KEY).unwrap_or_default()
    }

    /// Move `name` to the front of the recent list.
    pub fn add_recent(&self, name: &str) {
        let mut recent = self.recent();
        recent.retain(|n| n != name);
        recent.insert(0, name.to_string());
        recent.truncate(MAX_RECENT_CONNECTIONS);
        storage::save_json(self.store.as_ref(), RECENT_CONNECTIONS_KEY, &recent);
    }

    pub fn remove_recent(&self, name: &str) {
        let mut recent = self.recent();
        let before = recent.len();
        recent.retain(|n| n != name);
        if recent.len() != before {
            storage::save_json(self.store.as_ref(), RECENT_CONNECTIONS_KEY, &recent);
        }
    }

    /// Forget every profile and the recent list.
    pub fn clear(&self) {
        for key in [CONNECTIONS_KEY, RECENT_CONNECTIONS_KEY] {
            if let Err(e) = self.store.remove(key) {
                warn!(key, error = %e, "failed to clear stored connections");
            }
        }
    }
}
