//! # Navigation Context
//!
//! ## Responsibility
//! The console's own location (page URL plus document base) and everything
//! the connection layer reads from it: the active profile name (`con`),
//! query-string credentials (`_user`/`_pwd`), and URL-embedded connection
//! requests (`jolokiaUrl`, `title`, `token`, extra parameters).
//!
//! ## Guarantees
//! - Read-only: building a canonical location returns a new URL
//! - A canonical location carries `con=<name>` and nothing else, so tokens and
//!   agent URLs never stay visible after a redirect
//!
//! ## NOT Responsible For
//! - Performing the redirect (the caller replaces its location)
//! - Persisting the profile an embedded request describes

use tracing::{debug, warn};
use url::Url;

use crate::error::Result;
use crate::host::UserDetails;
use crate::profile::ConnectionProfile;

/// Query parameters that only steer the UI and never reach a profile.
const VIEW_PARAMS: [&str; 2] = ["sub-tab", "main-tab"];

/// Display name used when an embedded request carries no `title`.
pub const DEFAULT_CONNECTION_TITLE: &str = "Unknown Connection";

/// Where the console itself is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationContext {
    location: Url,
    document_base: String,
}

impl NavigationContext {
    pub fn new(location: Url, document_base: impl Into<String>) -> Self {
        Self {
            location,
            document_base: document_base.into(),
        }
    }

    pub fn parse(location: &str, document_base: impl Into<String>) -> Result<Self> {
        Ok(Self::new(Url::parse(location)?, document_base))
    }

    pub fn location(&self) -> &Url {
        &self.location
    }

    pub fn document_base(&self) -> &str {
        &self.document_base
    }

    /// First value of query parameter `name`, percent-decoded.
    pub fn param(&self, name: &str) -> Option<String> {
        self.location
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// All query parameters in order.
    pub fn params(&self) -> Vec<(String, String)> {
        self.location
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    /// Name of the profile this location selects, if any.
    pub fn connection_name(&self) -> Option<String> {
        self.param("con").filter(|name| !name.trim().is_empty())
    }

    /// `_user` / `_pwd` carried on the query string.
    pub fn query_credentials(&self) -> Option<UserDetails> {
        let details = UserDetails::new(self.param("_user")?, self.param("_pwd")?);
        details.is_complete().then_some(details)
    }

    /// A connection request embedded in this location, if one is present and valid.
    pub fn embedded_connection(&self) -> Option<EmbeddedConnection> {
        EmbeddedConnection::parse(&self.location)
    }

    /// This location with the fragment and every query parameter replaced by `con=<name>`.
    pub fn canonical_location(&self, name: &str) -> Url {
        let mut url = self.location.clone();
        url.set_fragment(None);
        url.query_pairs_mut().clear().append_pair("con", name);
        url
    }

    /// Append a query parameter.
    pub fn with_query(mut self, key: &str, value: &str) -> Self {
        self.location.query_pairs_mut().append_pair(key, value);
        self
    }

    /// Make an agent endpoint absolute against this page.
    ///
    /// Paths starting with `/` are taken from the page origin; other relative
    /// paths are joined onto the document base. When `fill_port` is set and
    /// the endpoint names no port, the page's own port is used. A port spelled
    /// out in the endpoint is kept even when it is the scheme default.
    pub fn resolve_endpoint_url(&self, endpoint: &str, fill_port: bool) -> Result<Url> {
        let mut url = match Url::parse(endpoint) {
            Ok(absolute) => absolute,
            Err(url::ParseError::RelativeUrlWithoutBase) if endpoint.starts_with('/') => {
                self.location.join(endpoint)?
            }
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let mut base = self.document_base.clone();
                if !base.ends_with('/') {
                    base.push('/');
                }
                self.location.join(&base)?.join(endpoint)?
            }
            Err(e) => return Err(e.into()),
        };
        if fill_port && url.port().is_none() && !names_port(endpoint) {
            if let Some(port) = self.location.port() {
                // Only fails for cannot-be-a-base URLs, which are not agent URLs.
                let _ = url.set_port(Some(port));
            }
        }
        debug!(endpoint, url = %url, "resolved agent URL");
        Ok(url)
    }
}

/// True when an absolute URL string carries `:<port>` in its authority.
///
/// `Url::port` reads `None` for `http://h:80` as well as `http://h`, so the
/// raw text decides whether a port was given.
fn names_port(endpoint: &str) -> bool {
    let Some((_, rest)) = endpoint.split_once("://") else {
        return false;
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit('@').next().unwrap_or_default();
    // IPv6 literals carry colons inside the brackets.
    let after_host = match host_port.rfind(']') {
        Some(end) => &host_port[end + 1..],
        None => host_port,
    };
    after_host
        .rsplit_once(':')
        .map(|(_, port)| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Embedded connection requests
// ---------------------------------------------------------------------------

/// A connection request carried on the navigation URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedConnection {
    pub name: String,
    pub agent_url: Url,
    pub token: Option<String>,
    /// Navigation query parameters to merge verbatim (view parameters removed).
    pub params: Vec<(String, String)>,
}

impl EmbeddedConnection {
    /// Parse `jolokiaUrl`/`title`/`token` from `location`.
    ///
    /// Returns `None` when no `jolokiaUrl` is present or it is not a valid URL.
    pub fn parse(location: &Url) -> Option<Self> {
        let params: Vec<(String, String)> = location
            .query_pairs()
            .filter(|(k, _)| !VIEW_PARAMS.iter().any(|view| k == view))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let lookup = |name: &str| {
            params
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };

        let raw_url = lookup("jolokiaUrl")?;
        let agent_url = match Url::parse(&raw_url) {
            Ok(url) => url,
            Err(e) => {
                warn!(jolokia_url = %raw_url, error = %e, "ignoring connection request with invalid agent URL");
                return None;
            }
        };
        let name = lookup("title")
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONNECTION_TITLE.to_string());
        let token = lookup("token")
            .or_else(|| location.fragment().map(str::to_string))
            .filter(|t| !t.trim().is_empty());

        Some(Self {
            name,
            agent_url,
            token,
            params,
        })
    }

    /// The profile this request describes.
    ///
    /// Components come from the agent URL, then the agent URL's own query,
    /// then the navigation parameters, each layer overriding the previous.
    pub fn to_profile(&self) -> ConnectionProfile {
        let mut profile = ConnectionProfile::from_url(self.name.clone(), &self.agent_url);
        if let Some(token) = &self.token {
            profile.token = Some(token.clone());
        }
        for (key, value) in self.agent_url.query_pairs() {
            profile.apply_param(&key, &value);
        }
        for (key, value) in &self.params {
            profile.apply_param(key, value);
        }
        profile.name = self.name.clone();
        profile
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nav(url: &str) -> NavigationContext {
        NavigationContext::parse(url, "/hawtio/").unwrap()
    }

    // -----------------------------------------------------------------------
    // Query access
    // -----------------------------------------------------------------------

    #[test]
    fn connection_name_from_con_param() {
        assert_eq!(nav("http://c/hawtio/?con=prod").connection_name().as_deref(), Some("prod"));
        assert_eq!(nav("http://c/hawtio/?con=%20").connection_name(), None);
        assert_eq!(nav("http://c/hawtio/").connection_name(), None);
    }

    #[test]
    fn query_credentials_need_both_halves() {
        let n = nav("http://c/?_user=admin&_pwd=pw");
        assert_eq!(n.query_credentials(), Some(UserDetails::new("admin", "pw")));
        assert_eq!(nav("http://c/?_user=admin").query_credentials(), None);
        assert_eq!(nav("http://c/?_user=admin&_pwd=").query_credentials(), None);
    }

    #[test]
    fn with_query_appends_encoded() {
        let n = nav("http://c/hawtio/").with_query("jolokiaUrl", "http://h:1/x");
        assert_eq!(n.param("jolokiaUrl").as_deref(), Some("http://h:1/x"));
    }

    // -----------------------------------------------------------------------
    // Canonical location
    // -----------------------------------------------------------------------

    #[test]
    fn canonical_location_keeps_only_con() {
        let n = nav("http://c:8080/hawtio/?jolokiaUrl=http%3A%2F%2Fh&token=abc&title=T#secret");
        let url = n.canonical_location("T");
        assert_eq!(url.as_str(), "http://c:8080/hawtio/?con=T");
    }

    // -----------------------------------------------------------------------
    // Endpoint resolution
    // -----------------------------------------------------------------------

    #[test]
    fn absolute_path_endpoint_uses_page_origin() {
        let url = nav("https://c:8443/hawtio/index.html")
            .resolve_endpoint_url("/jolokia", true)
            .unwrap();
        assert_eq!(url.as_str(), "https://c:8443/jolokia");
    }

    #[test]
    fn relative_endpoint_joins_document_base() {
        let url = nav("http://c:8080/some/page")
            .resolve_endpoint_url("jolokia", true)
            .unwrap();
        assert_eq!(url.as_str(), "http://c:8080/hawtio/jolokia");
    }

    #[test]
    fn document_base_without_trailing_slash() {
        let n = NavigationContext::parse("http://c/x", "/console").unwrap();
        assert_eq!(
            n.resolve_endpoint_url("jolokia", true).unwrap().as_str(),
            "http://c/console/jolokia"
        );
    }

    #[test]
    fn missing_port_filled_from_page_unless_authoritative() {
        let n = nav("http://c:8080/hawtio/");
        assert_eq!(
            n.resolve_endpoint_url("http://remote/jolokia", true).unwrap().as_str(),
            "http://remote:8080/jolokia"
        );
        assert_eq!(
            n.resolve_endpoint_url("http://remote/jolokia", false).unwrap().as_str(),
            "http://remote/jolokia"
        );
    }

    #[test]
    fn spelled_out_default_port_is_not_replaced() {
        let n = nav("http://c:8080/hawtio/");
        assert_eq!(
            n.resolve_endpoint_url("http://remote:80/jolokia", true).unwrap().as_str(),
            "http://remote/jolokia"
        );
        assert_eq!(
            n.resolve_endpoint_url("https://remote:443/jolokia", true).unwrap().as_str(),
            "https://remote/jolokia"
        );
        assert_eq!(
            n.resolve_endpoint_url("http://[::1]/jolokia", true).unwrap().as_str(),
            "http://[::1]:8080/jolokia"
        );
    }

    #[test]
    fn names_port_reads_the_authority_only() {
        assert!(names_port("http://h:80/j"));
        assert!(names_port("http://user:pw@h:8778"));
        assert!(names_port("http://[::1]:443/j"));
        assert!(!names_port("http://h/j:80"));
        assert!(!names_port("http://user:pw@h/j"));
        assert!(!names_port("http://[::1]/j"));
        assert!(!names_port("/jolokia"));
    }

    // -----------------------------------------------------------------------
    // Embedded connection requests
    // -----------------------------------------------------------------------

    #[test]
    fn embedded_request_builds_profile() {
        let n = nav("http://c/hawtio/?jolokiaUrl=http%3A%2F%2Fh%3A1234%2Fx&title=T&token=abc");
        let embedded = n.embedded_connection().unwrap();
        assert_eq!(embedded.name, "T");
        let profile = embedded.to_profile();
        assert_eq!(profile.name, "T");
        assert_eq!(profile.scheme, "http");
        assert_eq!(profile.host, "h");
        assert_eq!(profile.port, Some(1234));
        assert_eq!(profile.path, "x");
        assert_eq!(profile.token.as_deref(), Some("abc"));
    }

    #[test]
    fn token_falls_back_to_fragment() {
        let n = nav("http://c/hawtio/?jolokiaUrl=http%3A%2F%2Fh%2Fj#tok123");
        let embedded = n.embedded_connection().unwrap();
        assert_eq!(embedded.token.as_deref(), Some("tok123"));
        assert_eq!(embedded.name, DEFAULT_CONNECTION_TITLE);
    }

    #[test]
    fn view_params_are_dropped_and_extras_kept() {
        let n = nav("http://c/?jolokiaUrl=http%3A%2F%2Fh%2Fj&sub-tab=a&main-tab=b&region=eu");
        let profile = n.embedded_connection().unwrap().to_profile();
        assert!(!profile.extra.contains_key("sub-tab"));
        assert!(!profile.extra.contains_key("main-tab"));
        assert_eq!(profile.extra["region"], "eu");
    }

    #[test]
    fn agent_url_query_merged_before_navigation_params() {
        let n = nav("http://c/?jolokiaUrl=http%3A%2F%2Fh%2Fj%3Fzone%3Da&zone=b");
        let profile = n.embedded_connection().unwrap().to_profile();
        assert_eq!(profile.extra["zone"], "b");
    }

    #[test]
    fn invalid_agent_url_is_ignored() {
        assert!(nav("http://c/?jolokiaUrl=not%20a%20url").embedded_connection().is_none());
        assert!(nav("http://c/?title=T").embedded_connection().is_none());
    }
}
