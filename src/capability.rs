//! # Stage: Capability Probe
//!
//! ## Responsibility
//! Find out once per session whether the agent exposes the optimized
//! batched list operation, by listing the schema of the RBAC registry MBean.
//!
//! ## Guarantees
//! - Exactly one request per probe
//! - Never fails: every outcome maps to a [`ListCapability`]
//! - The result is recorded into the session status before it is returned
//!
//! ## NOT Responsible For
//! - Retrying an `Indeterminate` result (call [`CapabilityProber::probe`]
//!   again after re-authentication; the status accepts the upgrade)

use serde_json::Value;
use tracing::{debug, info};

use crate::error::ConnectError;
use crate::protocol::{escape_mbean_path, AgentRequest, AgentResponse};
use crate::session::{ListCapability, Session};

/// MBean whose `list` schema reveals the optimized operation.
pub const RBAC_REGISTRY_MBEAN: &str = "hawtio:type=security,name=RBACRegistry";

/// Probes sessions for the optimized list operation.
#[derive(Debug, Clone)]
pub struct CapabilityProber {
    mbean: String,
}

impl Default for CapabilityProber {
    fn default() -> Self {
        Self::new(RBAC_REGISTRY_MBEAN)
    }
}

impl CapabilityProber {
    pub fn new(mbean: impl Into<String>) -> Self {
        Self { mbean: mbean.into() }
    }

    /// The request a probe sends.
    pub fn probe_request(&self) -> AgentRequest {
        AgentRequest::list(Some(escape_mbean_path(&self.mbean)))
    }

    /// Probe `session`, record the result, and return it.
    ///
    /// A dummy session classifies as `GeneralOnly` without any request.
    pub async fn probe(&self, session: &Session) -> ListCapability {
        let capability = if session.is_dummy() {
            ListCapability::GeneralOnly
        } else {
            match session.request(self.probe_request()).await {
                Ok(Some(response)) => classify(&response),
                Ok(None) => ListCapability::GeneralOnly,
                Err(e) => classify_error(&e),
            }
        };
        if !session.record_capability(capability) {
            debug!(%capability, current = %session.list_capability(), "capability already settled");
        }
        info!(mbean = %self.mbean, %capability, "list capability probed");
        capability
    }
}

/// Classify one probe response.
pub fn classify(response: &AgentResponse) -> ListCapability {
    if response.is_auth_rejected() {
        return ListCapability::Indeterminate;
    }
    if response.is_success() && has_op_section(&response.value) {
        ListCapability::OptimizedAvailable
    } else {
        ListCapability::GeneralOnly
    }
}

/// Classify a failed probe exchange.
pub fn classify_error(error: &ConnectError) -> ListCapability {
    if error.is_auth_failure() || matches!(error.status(), Some(401 | 403)) {
        ListCapability::Indeterminate
    } else {
        debug!(error = %error, "probe failed");
        ListCapability::GeneralOnly
    }
}

fn has_op_section(value: &Value) -> bool {
    value.get("op").map(Value::is_object).unwrap_or(false)
}
