//! Runner-facing message shapes: heartbeats, the reserve/deploy/terminate
//! lifecycle and verb calls.

use serde::{Deserialize, Serialize};

use crate::key::{DeploymentKey, RunnerKey};
use crate::labels::Labels;

/// Lifecycle state of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    /// Available for placement.
    Idle,
    /// Claimed for a deployment but not yet running it.
    Reserved,
    /// Running a deployment.
    Assigned,
    /// Missed its heartbeat window; pending removal.
    Dead,
}

impl RunnerState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Reserved => "reserved",
            Self::Assigned => "assigned",
            Self::Dead => "dead",
        }
    }

    /// Whether the scheduler may hand this runner a deployment.
    #[must_use]
    pub const fn is_available(self) -> bool {
        matches!(self, Self::Idle)
    }
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Periodic registration sent by a runner to the controller. The first
/// heartbeat creates the runner record; later ones refresh it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerHeartbeat {
    pub key: RunnerKey,
    pub endpoint: String,
    pub state: RunnerState,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentKey>,
    /// Populated when the runner is reporting a local failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A fully qualified verb name, `module.verb` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VerbRef {
    pub module: String,
    pub name: String,
}

impl VerbRef {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for VerbRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub deployment: DeploymentKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub deployment: DeploymentKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminateRequest {
    pub deployment: DeploymentKey,
}

/// The runner reports the state it settled in after termination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminateResponse {
    pub state: RunnerState,
}

/// Call metadata forwarded out of band as headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMetadata {
    /// Request correlation ID, propagated across hops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// When set, route directly to this endpoint instead of via the routing
    /// table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_routing: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRequest {
    pub verb: VerbRef,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallResponse {
    pub body: serde_json::Value,
}

/// Header names used to carry [`CallMetadata`] and verb routing over HTTP.
pub mod headers {
    pub const DIRECT_ROUTING: &str = "x-parallax-direct";
    pub const VERB: &str = "x-parallax-verb";
    pub const REQUEST_ID: &str = "x-parallax-request-id";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_availability() {
        assert!(RunnerState::Idle.is_available());
        assert!(!RunnerState::Reserved.is_available());
        assert!(!RunnerState::Assigned.is_available());
        assert!(!RunnerState::Dead.is_available());
    }

    #[test]
    fn verb_ref_display() {
        assert_eq!(VerbRef::new("time", "now").to_string(), "time.now");
    }
}
