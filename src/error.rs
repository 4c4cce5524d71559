//! Crate-level error type.
//!
//! Most of the connection core deliberately degrades instead of failing
//! (discovery falls back to a dummy session, corrupt storage is replaced with
//! defaults). `ConnectError` covers what is left: outbound calls against a
//! live agent, configuration loading, and storage backends.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConnectError>;

/// Errors surfaced by the connection layer.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The agent replied with a non-2xx status other than 401/403.
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    /// The agent rejected the credentials (401/403). The session's
    /// auth-failure interceptor has already run when this is returned.
    #[error("authentication rejected with HTTP {status} by {url}")]
    AuthRejected { status: u16, url: String },

    /// A TCP-level connection could not be established or the request timed out.
    #[error("connection failed to {url}: {detail}")]
    Connect { url: String, detail: String },

    /// The agent answered the HTTP call but reported an error for this request.
    #[error("agent error {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// A durable storage backend failed to read or write `key`.
    #[error("storage failure on key '{key}': {detail}")]
    Storage { key: String, detail: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The operation needs a live agent but the session is a dummy.
    #[error("no agent connected")]
    NoAgent,
}

impl ConnectError {
    /// True for 401/403 rejections.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ConnectError::AuthRejected { .. })
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ConnectError::Http { status, .. }
            | ConnectError::AuthRejected { status, .. }
            | ConnectError::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for ConnectError {
    fn from(e: rusqlite::Error) -> Self {
        ConnectError::Storage {
            key: String::new(),
            detail: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_http_contains_status_and_url() {
        let err = ConnectError::Http {
            status: 503,
            url: "http://localhost:8080/jolokia".to_string(),
        };
        let s = err.to_string();
        assert!(s.contains("503"), "status in display: {s}");
        assert!(s.contains("http://localhost:8080/jolokia"), "url in display: {s}");
    }

    #[test]
    fn auth_rejected_is_auth_failure() {
        let err = ConnectError::AuthRejected {
            status: 401,
            url: "x".into(),
        };
        assert!(err.is_auth_failure());
        assert_eq!(err.status(), Some(401));
    }

    #[test]
    fn http_error_is_not_auth_failure() {
        let err = ConnectError::Http {
            status: 500,
            url: "x".into(),
        };
        assert!(!err.is_auth_failure());
        assert_eq!(err.status(), Some(500));
    }

    #[test]
    fn connect_error_has_no_status() {
        let err = ConnectError::Connect {
            url: "http://a".into(),
            detail: "refused".into(),
        };
        assert_eq!(err.status(), None);
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn remote_error_carries_in_body_status() {
        let err = ConnectError::Remote {
            status: 404,
            message: "InstanceNotFoundException".into(),
        };
        assert_eq!(err.status(), Some(404));
        assert!(!err.is_auth_failure());
    }

    #[test]
    fn json_error_converts() {
        let parse = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let err: ConnectError = parse.into();
        assert!(matches!(err, ConnectError::Json(_)));
    }
}
