//! The state store façade.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use parallax_proto::controller::DeploymentArtefact;
use parallax_proto::{ControllerKey, Digest, DeploymentKey, Labels, Module, RunnerKey};

use crate::error::StoreResult;
use crate::notify::Notification;
use crate::types::{ControllerRow, Deployment, IngressRoute, Reconciliation, Route, Runner};

/// An ingress route before the store has bound it to a deployment key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRouteSpec {
    pub method: String,
    pub path: String,
    pub verb: String,
}

/// A claimed runner. The claim is visible to concurrent reservers from the
/// moment it is taken; only `commit` makes the binding durable, while
/// `rollback` (or dropping the handle) returns the runner to the idle pool.
#[async_trait]
pub trait Reservation: Send {
    fn runner(&self) -> &Runner;
    async fn commit(&mut self) -> StoreResult<()>;
    async fn rollback(&mut self) -> StoreResult<()>;
}

/// Every operation the scheduling plane performs against cluster state.
#[async_trait]
pub trait StateStore: Send + Sync {
    // Runners.
    async fn upsert_runner(&self, runner: Runner) -> StoreResult<()>;
    async fn deregister_runner(&self, key: &RunnerKey) -> StoreResult<()>;
    async fn get_runner(&self, key: &RunnerKey) -> StoreResult<Runner>;
    async fn list_runners(&self) -> StoreResult<Vec<Runner>>;
    async fn runners_for_deployment(&self, key: &DeploymentKey) -> StoreResult<Vec<Runner>>;

    /// Claim an idle runner whose labels satisfy `predicate` for the given
    /// deployment, reserving it for at most `timeout`.
    async fn reserve_runner(
        &self,
        deployment: &DeploymentKey,
        timeout: Duration,
        predicate: &Labels,
    ) -> StoreResult<Box<dyn Reservation>>;

    /// Return runners whose reservation outlived its timeout to the idle
    /// pool. Returns the number of reservations expired.
    async fn expire_runner_reservations(&self) -> StoreResult<u64>;

    /// Remove runners that have not heartbeated within `age`.
    async fn kill_stale_runners(&self, age: Duration) -> StoreResult<u64>;

    // Artefacts.
    async fn get_missing_artefacts(&self, digests: &[Digest]) -> StoreResult<Vec<Digest>>;
    async fn create_artefact(&self, content: Bytes) -> StoreResult<Digest>;
    async fn get_artefact(&self, digest: &Digest) -> StoreResult<Bytes>;

    // Deployments.
    async fn create_deployment(
        &self,
        language: &str,
        schema: Module,
        artefacts: Vec<DeploymentArtefact>,
        ingress: Vec<IngressRouteSpec>,
    ) -> StoreResult<DeploymentKey>;
    async fn get_deployment(&self, key: &DeploymentKey) -> StoreResult<Deployment>;
    async fn list_deployments(&self) -> StoreResult<Vec<Deployment>>;
    async fn get_active_deployments(&self) -> StoreResult<Vec<Deployment>>;
    async fn active_deployment_for_module(&self, module: &str) -> StoreResult<Option<Deployment>>;

    /// Set the replica target of a single deployment.
    async fn set_deployment_replicas(&self, key: &DeploymentKey, min_replicas: u32)
        -> StoreResult<()>;

    /// Atomically activate `key` with `min_replicas` and zero the replica
    /// target of any previously active deployment of the same module.
    async fn replace_deployment(&self, key: &DeploymentKey, min_replicas: u32) -> StoreResult<()>;

    /// Deployments whose assigned replica count differs from their target.
    async fn deployments_needing_reconciliation(&self) -> StoreResult<Vec<Reconciliation>>;

    // Routing.
    async fn routing_table(&self, module: &str) -> StoreResult<Vec<Route>>;
    async fn list_routes(&self) -> StoreResult<Vec<Route>>;
    async fn get_ingress_routes(&self, method: &str, path: &str) -> StoreResult<Vec<IngressRoute>>;
    async fn list_ingress_routes(&self) -> StoreResult<Vec<IngressRoute>>;

    // Controllers.
    async fn upsert_controller(&self, key: &ControllerKey, endpoint: &str) -> StoreResult<()>;
    async fn list_controllers(&self) -> StoreResult<Vec<ControllerRow>>;
    async fn kill_stale_controllers(&self, age: Duration) -> StoreResult<u64>;

    /// Subscribe to raw change notifications for the deployments table.
    fn subscribe(&self) -> broadcast::Receiver<Notification>;
}
