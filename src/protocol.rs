//! Jolokia wire types.
//!
//! Only the request/response envelope is modelled here. The shape of `value`
//! (attribute trees, MBean domains, operation signatures) belongs to the agent
//! and is carried as raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Operation kind understood by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    Read,
    Write,
    Exec,
    List,
    Search,
    Version,
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestType::Read    => "read",
            RequestType::Write   => "write",
            RequestType::Exec    => "exec",
            RequestType::List    => "list",
            RequestType::Search  => "search",
            RequestType::Version => "version",
        };
        write!(f, "{s}")
    }
}

/// One request object. A batch is a JSON array of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    #[serde(rename = "type")]
    pub kind: RequestType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mbean: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl AgentRequest {
    fn bare(kind: RequestType) -> Self {
        Self {
            kind,
            mbean: None,
            attribute: None,
            operation: None,
            arguments: None,
            path: None,
            value: None,
        }
    }

    /// Read one attribute of `mbean`.
    pub fn read(mbean: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            mbean: Some(mbean.into()),
            attribute: Some(attribute.into()),
            ..Self::bare(RequestType::Read)
        }
    }

    /// Set one attribute of `mbean` to `value`.
    pub fn write(mbean: impl Into<String>, attribute: impl Into<String>, value: Value) -> Self {
        Self {
            mbean: Some(mbean.into()),
            attribute: Some(attribute.into()),
            value: Some(value),
            ..Self::bare(RequestType::Write)
        }
    }

    /// Invoke `operation` on `mbean`.
    pub fn exec(mbean: impl Into<String>, operation: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            mbean: Some(mbean.into()),
            operation: Some(operation.into()),
            arguments: Some(arguments),
            ..Self::bare(RequestType::Exec)
        }
    }

    /// List the schema below `path` (`None` lists everything).
    pub fn list(path: Option<String>) -> Self {
        Self {
            path,
            ..Self::bare(RequestType::List)
        }
    }

    /// Search for MBean names matching `pattern`.
    pub fn search(pattern: impl Into<String>) -> Self {
        Self {
            mbean: Some(pattern.into()),
            ..Self::bare(RequestType::Search)
        }
    }

    /// Agent and protocol version.
    pub fn version() -> Self {
        Self::bare(RequestType::Version)
    }

    /// Attach an inner path (for `read`/`write` into nested values).
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// One response object, positionally matched to its request in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    #[serde(default)]
    pub value: Value,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, rename = "error_type", skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl AgentResponse {
    /// A successful response carrying `value`.
    pub fn ok(value: Value) -> Self {
        Self {
            value,
            status: 200,
            error: None,
            error_type: None,
            request: None,
            timestamp: None,
        }
    }

    /// An in-body error response.
    pub fn failed(status: u16, error: impl Into<String>) -> Self {
        Self {
            value: Value::Null,
            status,
            error: Some(error.into()),
            error_type: None,
            request: None,
            timestamp: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 200
    }

    /// The agent refused this particular request for authorization reasons.
    pub fn is_auth_rejected(&self) -> bool {
        self.status == 401 || self.status == 403
    }
}

/// Decode a reply body that may be a single response or a batch array.
pub fn decode_responses(body: &[u8]) -> serde_json::Result<Vec<AgentResponse>> {
    let value: Value = serde_json::from_slice(body)?;
    match value {
        Value::Array(items) => items.into_iter().map(serde_json::from_value).collect(),
        single => Ok(vec![serde_json::from_value(single)?]),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Escape an MBean name for use as a `list` path segment.
///
/// `!` and `/` are escaped with `!`; the domain separator `:` becomes `/`.
pub fn escape_mbean_path(mbean: &str) -> String {
    let (domain, props) = match mbean.split_once(':') {
        Some(parts) => parts,
        None => return escape_segment(mbean),
    };
    format!("{}/{}", escape_segment(domain), escape_segment(props))
}

fn escape_segment(segment: &str) -> String {
    segment.replace('!', "!!").replace('/', "!/")
}
