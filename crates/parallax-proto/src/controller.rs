//! Controller-facing message shapes: artefact transfer, deployment
//! management, schema change notifications and status reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::key::{ControllerKey, DeploymentKey, RunnerKey};
use crate::labels::Labels;
use crate::runner::RunnerState;
use crate::schema::Module;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtefactDiffRequest {
    pub digests: Vec<Digest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtefactDiffResponse {
    /// Digests from the request that the controller does not hold.
    pub missing: Vec<Digest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadArtefactResponse {
    pub digest: Digest,
}

/// One artefact attached to a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentArtefact {
    pub digest: Digest,
    /// Path the artefact is unpacked to, relative to the deployment root.
    pub path: String,
    pub executable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDeploymentRequest {
    pub language: String,
    pub schema: Module,
    pub artefacts: Vec<DeploymentArtefact>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDeploymentResponse {
    pub key: DeploymentKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceDeployRequest {
    pub min_replicas: u32,
}

/// One chunk of a deployment artefact stream. A change of `digest` between
/// consecutive chunks marks a file boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtefactChunk {
    pub artefact: DeploymentArtefact,
    #[serde(with = "bytes_hex")]
    pub chunk: bytes::Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaChangeType {
    Added,
    Changed,
    Removed,
}

/// One event on the schema fan-out stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChange {
    pub change: SchemaChangeType,
    pub module_name: String,
    pub deployment: DeploymentKey,
    /// Absent for removals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Module>,
    /// True while further events from the same batch are still in flight;
    /// false on the final event of a batch.
    pub more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub key: ControllerKey,
    pub endpoint: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerStatus {
    pub key: RunnerKey,
    pub endpoint: String,
    pub state: RunnerState,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub key: DeploymentKey,
    pub name: String,
    pub module: String,
    pub language: String,
    pub min_replicas: u32,
    pub assigned_replicas: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteStatus {
    pub module: String,
    pub deployment: DeploymentKey,
    pub runner: RunnerKey,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRouteStatus {
    pub method: String,
    pub path: String,
    pub module: String,
    pub verb: String,
    pub deployment: DeploymentKey,
}

/// Aggregate cluster view served by the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub controllers: Vec<ControllerStatus>,
    pub runners: Vec<RunnerStatus>,
    pub deployments: Vec<DeploymentStatus>,
    pub routes: Vec<RouteStatus>,
    pub ingress_routes: Vec<IngressRouteStatus>,
}

/// Readiness probe response. `not_ready` carries a reason while the
/// controller is still coming up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_ready: Option<String>,
}

mod bytes_hex {
    //! Raw chunk bytes travel hex-encoded in JSON.

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &bytes::Bytes, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<bytes::Bytes, D::Error> {
        let s = String::deserialize(de)?;
        hex::decode(&s)
            .map(bytes::Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artefact_chunk_round_trip() {
        let chunk = ArtefactChunk {
            artefact: DeploymentArtefact {
                digest: Digest::of(b"artefact"),
                path: "bin/main".into(),
                executable: true,
            },
            chunk: bytes::Bytes::from_static(&[0x00, 0x01, 0xff]),
        };
        let json = serde_json::to_string(&chunk).unwrap();
        let back: ArtefactChunk = serde_json::from_str(&json).unwrap();
        assert_eq!(back, chunk);
    }
}
