//! Row types held by the state store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parallax_proto::controller::DeploymentArtefact;
use parallax_proto::{ControllerKey, DeploymentKey, Labels, Module, RunnerKey, RunnerState};

/// A registered runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runner {
    pub key: RunnerKey,
    pub endpoint: String,
    pub state: RunnerState,
    pub labels: Labels,
    /// Set while the runner is reserved for or assigned to a deployment.
    pub deployment: Option<DeploymentKey>,
    pub last_seen: DateTime<Utc>,
}

/// One immutable deployment of a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub key: DeploymentKey,
    pub name: String,
    pub module: String,
    pub language: String,
    pub schema: Module,
    pub min_replicas: u32,
    pub labels: Labels,
    pub artefacts: Vec<DeploymentArtefact>,
    pub created_at: DateTime<Utc>,
}

impl Deployment {
    /// A deployment is active while it wants replicas.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.min_replicas > 0
    }
}

/// A controller instance known to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerRow {
    pub key: ControllerKey,
    pub endpoint: String,
    pub last_seen: DateTime<Utc>,
}

/// A verb-call route: an assigned runner serving a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub module: String,
    pub deployment: DeploymentKey,
    pub runner: RunnerKey,
    pub endpoint: String,
}

/// An HTTP ingress route derived from verb metadata at deployment creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRoute {
    pub method: String,
    pub path: String,
    pub deployment: DeploymentKey,
    pub module: String,
    pub verb: String,
}

/// Replica accounting for one deployment, as seen by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub deployment: DeploymentKey,
    pub module: String,
    pub language: String,
    pub assigned_replicas: u32,
    pub required_replicas: u32,
}
