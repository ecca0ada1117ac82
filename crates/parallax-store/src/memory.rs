//! In-memory state store.
//!
//! All state sits behind one mutex, so every trait operation is atomic with
//! respect to every other. Reservations take effect inside the claiming call
//! and are therefore visible to concurrent reservers immediately, matching
//! the row-lock visibility a transactional backend provides.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use parallax_proto::controller::DeploymentArtefact;
use parallax_proto::key::deployment_name;
use parallax_proto::{
    ControllerKey, Digest, DeploymentKey, Labels, Module, RunnerKey, RunnerState,
};

use crate::error::{StoreError, StoreResult};
use crate::notify::{Action, DeploymentImage, Notification};
use crate::store::{IngressRouteSpec, Reservation, StateStore};
use crate::types::{ControllerRow, Deployment, IngressRoute, Reconciliation, Route, Runner};

const NOTIFY_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
struct RunnerSlot {
    runner: Runner,
    /// Set while the runner is RESERVED.
    reserved_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    controllers: HashMap<ControllerKey, ControllerRow>,
    runners: HashMap<RunnerKey, RunnerSlot>,
    deployments: HashMap<DeploymentKey, Deployment>,
    artefacts: HashMap<Digest, Bytes>,
    ingress_routes: Vec<IngressRoute>,
}

impl Inner {
    fn assigned_count(&self, key: &DeploymentKey) -> u32 {
        self.runners
            .values()
            .filter(|slot| {
                slot.runner.state == RunnerState::Assigned
                    && slot.runner.deployment.as_ref() == Some(key)
            })
            .count() as u32
    }

    fn routes_for(&self, key: &DeploymentKey, module: &str) -> Vec<Route> {
        self.runners
            .values()
            .filter(|slot| {
                slot.runner.state == RunnerState::Assigned
                    && slot.runner.deployment.as_ref() == Some(key)
            })
            .map(|slot| Route {
                module: module.to_owned(),
                deployment: *key,
                runner: slot.runner.key,
                endpoint: slot.runner.endpoint.clone(),
            })
            .collect()
    }
}

/// The shipped [`StateStore`] implementation.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    notify: broadcast::Sender<Notification>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            notify,
        }
    }

    fn publish(&self, action: Action, old: Option<&Deployment>, new: Option<&Deployment>) {
        let image = |d: &Deployment| DeploymentImage {
            key: d.key,
            module: d.module.clone(),
            min_replicas: d.min_replicas,
        };
        // Nobody listening is fine.
        let _ = self.notify.send(Notification {
            table: "deployments",
            action,
            old: old.map(image),
            new: new.map(image),
        });
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn upsert_runner(&self, runner: Runner) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        match runner.state {
            RunnerState::Reserved | RunnerState::Assigned => {
                let deployment = runner.deployment.as_ref().ok_or_else(|| {
                    StoreError::InvalidArgument(format!(
                        "runner {} is {} without a deployment",
                        runner.key, runner.state,
                    ))
                })?;
                if !inner.deployments.contains_key(deployment) {
                    return Err(StoreError::not_found("deployment", deployment));
                }
            }
            RunnerState::Idle | RunnerState::Dead => {}
        }
        let conflict = inner.runners.values().any(|slot| {
            slot.runner.key != runner.key
                && slot.runner.state != RunnerState::Dead
                && slot.runner.endpoint == runner.endpoint
        });
        if conflict {
            return Err(StoreError::Conflict(format!(
                "endpoint {} is registered to another runner",
                runner.endpoint,
            )));
        }
        let reserved_until = match runner.state {
            RunnerState::Reserved => inner
                .runners
                .get(&runner.key)
                .and_then(|slot| slot.reserved_until),
            _ => None,
        };
        inner.runners.insert(
            runner.key,
            RunnerSlot {
                runner,
                reserved_until,
            },
        );
        Ok(())
    }

    async fn deregister_runner(&self, key: &RunnerKey) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner
            .runners
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("runner", key))
    }

    async fn get_runner(&self, key: &RunnerKey) -> StoreResult<Runner> {
        let inner = self.inner.lock();
        inner
            .runners
            .get(key)
            .map(|slot| slot.runner.clone())
            .ok_or_else(|| StoreError::not_found("runner", key))
    }

    async fn list_runners(&self) -> StoreResult<Vec<Runner>> {
        let inner = self.inner.lock();
        let mut runners: Vec<_> = inner.runners.values().map(|s| s.runner.clone()).collect();
        runners.sort_by_key(|r| r.key);
        Ok(runners)
    }

    async fn runners_for_deployment(&self, key: &DeploymentKey) -> StoreResult<Vec<Runner>> {
        let inner = self.inner.lock();
        let mut runners: Vec<_> = inner
            .runners
            .values()
            .filter(|slot| slot.runner.deployment.as_ref() == Some(key))
            .map(|slot| slot.runner.clone())
            .collect();
        runners.sort_by_key(|r| r.key);
        Ok(runners)
    }

    async fn reserve_runner(
        &self,
        deployment: &DeploymentKey,
        timeout: Duration,
        predicate: &Labels,
    ) -> StoreResult<Box<dyn Reservation>> {
        let mut inner = self.inner.lock();
        if !inner.deployments.contains_key(deployment) {
            return Err(StoreError::not_found("deployment", deployment));
        }
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|_| StoreError::InvalidArgument("reservation timeout out of range".into()))?;
        let key = inner
            .runners
            .values()
            .filter(|slot| {
                slot.runner.state == RunnerState::Idle && slot.runner.labels.matches(predicate)
            })
            .map(|slot| slot.runner.key)
            .min()
            .ok_or_else(|| StoreError::not_found("idle runner", deployment))?;
        let slot = inner
            .runners
            .get_mut(&key)
            .ok_or_else(|| StoreError::not_found("runner", key))?;
        slot.runner.state = RunnerState::Reserved;
        slot.runner.deployment = Some(*deployment);
        slot.reserved_until = Some(Utc::now() + timeout);
        let runner = slot.runner.clone();
        drop(inner);
        Ok(Box::new(MemoryReservation {
            inner: Arc::clone(&self.inner),
            runner,
            deployment: *deployment,
            settled: false,
        }))
    }

    async fn expire_runner_reservations(&self) -> StoreResult<u64> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let mut expired = 0;
        for slot in inner.runners.values_mut() {
            if slot.runner.state != RunnerState::Reserved {
                continue;
            }
            let Some(deadline) = slot.reserved_until else {
                continue;
            };
            if deadline < now {
                debug!(runner = %slot.runner.key, "expiring runner reservation");
                slot.runner.state = RunnerState::Idle;
                slot.runner.deployment = None;
                slot.reserved_until = None;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn kill_stale_runners(&self, age: Duration) -> StoreResult<u64> {
        let age = chrono::Duration::from_std(age)
            .map_err(|_| StoreError::InvalidArgument("age out of range".into()))?;
        let cutoff = Utc::now() - age;
        let mut inner = self.inner.lock();
        let before = inner.runners.len();
        inner.runners.retain(|_, slot| slot.runner.last_seen >= cutoff);
        Ok((before - inner.runners.len()) as u64)
    }

    async fn get_missing_artefacts(&self, digests: &[Digest]) -> StoreResult<Vec<Digest>> {
        let inner = self.inner.lock();
        let mut missing: Vec<_> = digests
            .iter()
            .filter(|digest| !inner.artefacts.contains_key(digest))
            .copied()
            .collect();
        missing.sort();
        missing.dedup();
        Ok(missing)
    }

    async fn create_artefact(&self, content: Bytes) -> StoreResult<Digest> {
        let digest = Digest::of(&content);
        let mut inner = self.inner.lock();
        inner.artefacts.entry(digest).or_insert(content);
        Ok(digest)
    }

    async fn get_artefact(&self, digest: &Digest) -> StoreResult<Bytes> {
        let inner = self.inner.lock();
        inner
            .artefacts
            .get(digest)
            .cloned()
            .ok_or_else(|| StoreError::not_found("artefact", digest))
    }

    async fn create_deployment(
        &self,
        language: &str,
        schema: Module,
        artefacts: Vec<DeploymentArtefact>,
        ingress: Vec<IngressRouteSpec>,
    ) -> StoreResult<DeploymentKey> {
        if schema.name.is_empty() {
            return Err(StoreError::InvalidArgument("schema has no module name".into()));
        }
        let schema_digest = schema.digest();
        let mut digests: Vec<_> = artefacts.iter().map(|a| a.digest).collect();
        digests.sort();

        let mut inner = self.inner.lock();
        for digest in &digests {
            if !inner.artefacts.contains_key(digest) {
                return Err(StoreError::not_found("artefact", digest));
            }
        }

        // Identical module content resolves to the existing deployment.
        let existing = inner.deployments.values().find(|d| {
            if d.module != schema.name || d.schema.digest() != schema_digest {
                return false;
            }
            let mut theirs: Vec<_> = d.artefacts.iter().map(|a| a.digest).collect();
            theirs.sort();
            theirs == digests
        });
        if let Some(existing) = existing {
            return Ok(existing.key);
        }

        let key = DeploymentKey::generate();
        let deployment = Deployment {
            key,
            name: deployment_name(&schema.name),
            module: schema.name.clone(),
            language: language.to_owned(),
            schema,
            min_replicas: 0,
            labels: Labels::language(language),
            artefacts,
            created_at: Utc::now(),
        };
        for route in ingress {
            inner.ingress_routes.push(IngressRoute {
                method: route.method,
                path: route.path,
                deployment: key,
                module: deployment.module.clone(),
                verb: route.verb,
            });
        }
        inner.deployments.insert(key, deployment.clone());
        drop(inner);
        self.publish(Action::Insert, None, Some(&deployment));
        Ok(key)
    }

    async fn get_deployment(&self, key: &DeploymentKey) -> StoreResult<Deployment> {
        let inner = self.inner.lock();
        inner
            .deployments
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found("deployment", key))
    }

    async fn list_deployments(&self) -> StoreResult<Vec<Deployment>> {
        let inner = self.inner.lock();
        let mut deployments: Vec<_> = inner.deployments.values().cloned().collect();
        deployments.sort_by_key(|d| d.key);
        Ok(deployments)
    }

    async fn get_active_deployments(&self) -> StoreResult<Vec<Deployment>> {
        let inner = self.inner.lock();
        let mut deployments: Vec<_> = inner
            .deployments
            .values()
            .filter(|d| d.is_active())
            .cloned()
            .collect();
        deployments.sort_by_key(|d| d.key);
        Ok(deployments)
    }

    async fn active_deployment_for_module(&self, module: &str) -> StoreResult<Option<Deployment>> {
        let inner = self.inner.lock();
        Ok(inner
            .deployments
            .values()
            .filter(|d| d.is_active() && d.module == module)
            .max_by_key(|d| d.key)
            .cloned())
    }

    async fn set_deployment_replicas(
        &self,
        key: &DeploymentKey,
        min_replicas: u32,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let deployment = inner
            .deployments
            .get_mut(key)
            .ok_or_else(|| StoreError::not_found("deployment", key))?;
        let old = deployment.clone();
        deployment.min_replicas = min_replicas;
        let new = deployment.clone();
        drop(inner);
        self.publish(Action::Update, Some(&old), Some(&new));
        Ok(())
    }

    async fn replace_deployment(&self, key: &DeploymentKey, min_replicas: u32) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let target = inner
            .deployments
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found("deployment", key))?;
        if min_replicas > 0 && target.is_active() {
            return Err(StoreError::Conflict(format!(
                "deployment {key} is already active",
            )));
        }

        let predecessor = inner
            .deployments
            .values()
            .find(|d| d.is_active() && d.module == target.module && d.key != *key)
            .map(|d| d.key);
        let mut changes = Vec::new();
        if let Some(old_key) = predecessor {
            if let Some(old) = inner.deployments.get_mut(&old_key) {
                let before = old.clone();
                old.min_replicas = 0;
                changes.push((before, old.clone()));
            }
        }
        if let Some(target) = inner.deployments.get_mut(key) {
            let before = target.clone();
            target.min_replicas = min_replicas;
            changes.push((before, target.clone()));
        }
        drop(inner);
        for (old, new) in &changes {
            self.publish(Action::Update, Some(old), Some(new));
        }
        Ok(())
    }

    async fn deployments_needing_reconciliation(&self) -> StoreResult<Vec<Reconciliation>> {
        let inner = self.inner.lock();
        let mut out: Vec<_> = inner
            .deployments
            .values()
            .filter_map(|d| {
                let assigned = inner.assigned_count(&d.key);
                (assigned != d.min_replicas).then(|| Reconciliation {
                    deployment: d.key,
                    module: d.module.clone(),
                    language: d.language.clone(),
                    assigned_replicas: assigned,
                    required_replicas: d.min_replicas,
                })
            })
            .collect();
        out.sort_by_key(|r| r.deployment);
        Ok(out)
    }

    async fn routing_table(&self, module: &str) -> StoreResult<Vec<Route>> {
        let inner = self.inner.lock();
        let mut routes = Vec::new();
        for deployment in inner.deployments.values() {
            if deployment.is_active() && deployment.module == module {
                routes.extend(inner.routes_for(&deployment.key, module));
            }
        }
        routes.sort_by_key(|r| r.runner);
        Ok(routes)
    }

    async fn list_routes(&self) -> StoreResult<Vec<Route>> {
        let inner = self.inner.lock();
        let mut routes = Vec::new();
        for deployment in inner.deployments.values() {
            if deployment.is_active() {
                routes.extend(inner.routes_for(&deployment.key, &deployment.module));
            }
        }
        routes.sort_by_key(|r| r.runner);
        Ok(routes)
    }

    async fn get_ingress_routes(&self, method: &str, path: &str) -> StoreResult<Vec<IngressRoute>> {
        let inner = self.inner.lock();
        Ok(inner
            .ingress_routes
            .iter()
            .filter(|route| {
                route.method == method
                    && route.path == path
                    && inner
                        .deployments
                        .get(&route.deployment)
                        .is_some_and(Deployment::is_active)
            })
            .cloned()
            .collect())
    }

    async fn list_ingress_routes(&self) -> StoreResult<Vec<IngressRoute>> {
        let inner = self.inner.lock();
        Ok(inner
            .ingress_routes
            .iter()
            .filter(|route| {
                inner
                    .deployments
                    .get(&route.deployment)
                    .is_some_and(Deployment::is_active)
            })
            .cloned()
            .collect())
    }

    async fn upsert_controller(&self, key: &ControllerKey, endpoint: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.controllers.insert(
            *key,
            ControllerRow {
                key: *key,
                endpoint: endpoint.to_owned(),
                last_seen: Utc::now(),
            },
        );
        Ok(())
    }

    async fn list_controllers(&self) -> StoreResult<Vec<ControllerRow>> {
        let inner = self.inner.lock();
        let mut controllers: Vec<_> = inner.controllers.values().cloned().collect();
        controllers.sort_by_key(|c| c.key);
        Ok(controllers)
    }

    async fn kill_stale_controllers(&self, age: Duration) -> StoreResult<u64> {
        let age = chrono::Duration::from_std(age)
            .map_err(|_| StoreError::InvalidArgument("age out of range".into()))?;
        let cutoff = Utc::now() - age;
        let mut inner = self.inner.lock();
        let before = inner.controllers.len();
        inner.controllers.retain(|_, c| c.last_seen >= cutoff);
        Ok((before - inner.controllers.len()) as u64)
    }

    fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notify.subscribe()
    }
}

struct MemoryReservation {
    inner: Arc<Mutex<Inner>>,
    runner: Runner,
    deployment: DeploymentKey,
    settled: bool,
}

impl MemoryReservation {
    fn release(&self) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.runners.get_mut(&self.runner.key) {
            if slot.runner.state == RunnerState::Reserved
                && slot.runner.deployment == Some(self.deployment)
            {
                slot.runner.state = RunnerState::Idle;
                slot.runner.deployment = None;
                slot.reserved_until = None;
            }
        }
    }
}

#[async_trait]
impl Reservation for MemoryReservation {
    fn runner(&self) -> &Runner {
        &self.runner
    }

    async fn commit(&mut self) -> StoreResult<()> {
        if self.settled {
            return Err(StoreError::FailedPrecondition(
                "reservation already settled".into(),
            ));
        }
        let inner = self.inner.lock();
        let live = inner.runners.get(&self.runner.key).is_some_and(|slot| {
            slot.runner.state == RunnerState::Reserved
                && slot.runner.deployment == Some(self.deployment)
        });
        drop(inner);
        if !live {
            self.settled = true;
            return Err(StoreError::FailedPrecondition(format!(
                "reservation of runner {} was lost",
                self.runner.key,
            )));
        }
        self.settled = true;
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        if self.settled {
            return Err(StoreError::FailedPrecondition(
                "reservation already settled".into(),
            ));
        }
        self.settled = true;
        self.release();
        Ok(())
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        if !self.settled {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parallax_proto::schema::{Ingress, TypeRef, Verb};

    fn runner(endpoint: &str, language: &str) -> Runner {
        Runner {
            key: RunnerKey::generate(),
            endpoint: endpoint.to_owned(),
            state: RunnerState::Idle,
            labels: Labels::language(language),
            deployment: None,
            last_seen: Utc::now(),
        }
    }

    fn module(name: &str) -> Module {
        let mut module = Module::new(name);
        module.verbs.push(Verb {
            name: "status".into(),
            request: TypeRef::local("StatusRequest"),
            response: TypeRef::local("StatusResponse"),
            ingress: Some(Ingress {
                method: "GET".into(),
                path: format!("/{name}/status"),
            }),
        });
        module
    }

    async fn deployment(store: &MemoryStore, name: &str) -> DeploymentKey {
        let digest = store
            .create_artefact(Bytes::from(format!("{name} binary")))
            .await
            .unwrap();
        store
            .create_deployment(
                "go",
                module(name),
                vec![DeploymentArtefact {
                    digest,
                    path: "main".into(),
                    executable: true,
                }],
                vec![IngressRouteSpec {
                    method: "GET".into(),
                    path: format!("/{name}/status"),
                    verb: "status".into(),
                }],
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn artefacts_round_trip_by_digest() {
        let store = MemoryStore::new();
        let content = Bytes::from_static(b"artefact body");
        let digest = store.create_artefact(content.clone()).await.unwrap();
        assert_eq!(digest, Digest::of(&content));
        assert_eq!(store.get_artefact(&digest).await.unwrap(), content);

        let absent = Digest::of(b"something else");
        assert_eq!(
            store.get_missing_artefacts(&[digest, absent]).await.unwrap(),
            vec![absent],
        );
    }

    #[tokio::test]
    async fn upsert_rejects_duplicate_endpoints() {
        let store = MemoryStore::new();
        let first = runner("http://10.0.0.1:8893", "go");
        store.upsert_runner(first.clone()).await.unwrap();

        let mut second = runner("http://10.0.0.1:8893", "go");
        second.endpoint = first.endpoint.clone();
        let err = store.upsert_runner(second).await.unwrap_err();
        assert_eq!(err.kind(), parallax_proto::ErrorKind::Conflict);

        // Refreshing the same runner is fine.
        store.upsert_runner(first).await.unwrap();
    }

    #[tokio::test]
    async fn assigned_runner_requires_live_deployment() {
        let store = MemoryStore::new();
        let mut r = runner("http://10.0.0.2:8893", "go");
        r.state = RunnerState::Assigned;
        let err = store.upsert_runner(r.clone()).await.unwrap_err();
        assert_eq!(err.kind(), parallax_proto::ErrorKind::InvalidArgument);

        r.deployment = Some(DeploymentKey::generate());
        let err = store.upsert_runner(r).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn reservation_is_visible_before_commit() {
        let store = MemoryStore::new();
        store.upsert_runner(runner("http://10.0.0.3:8893", "go")).await.unwrap();
        let key = deployment(&store, "alpha").await;

        let mut reservation = store
            .reserve_runner(&key, Duration::from_secs(120), &Labels::language("go"))
            .await
            .unwrap();
        assert_eq!(reservation.runner().state, RunnerState::Reserved);

        // The only runner is claimed, so a second reservation finds nothing.
        let err = store
            .reserve_runner(&key, Duration::from_secs(120), &Labels::language("go"))
            .await
            .map(|_| ())
            .unwrap_err();
        assert!(err.is_not_found());

        reservation.commit().await.unwrap();
        let runner = store.get_runner(&reservation.runner().key).await.unwrap();
        assert_eq!(runner.state, RunnerState::Reserved);
        assert_eq!(runner.deployment, Some(key));
    }

    #[tokio::test]
    async fn rollback_returns_runner_to_idle() {
        let store = MemoryStore::new();
        store.upsert_runner(runner("http://10.0.0.4:8893", "go")).await.unwrap();
        let key = deployment(&store, "beta").await;

        let mut reservation = store
            .reserve_runner(&key, Duration::from_secs(120), &Labels::language("go"))
            .await
            .unwrap();
        let runner_key = reservation.runner().key;
        reservation.rollback().await.unwrap();

        let runner = store.get_runner(&runner_key).await.unwrap();
        assert_eq!(runner.state, RunnerState::Idle);
        assert_eq!(runner.deployment, None);
    }

    #[tokio::test]
    async fn dropped_reservation_rolls_back() {
        let store = MemoryStore::new();
        store.upsert_runner(runner("http://10.0.0.5:8893", "go")).await.unwrap();
        let key = deployment(&store, "gamma").await;

        let runner_key = {
            let reservation = store
                .reserve_runner(&key, Duration::from_secs(120), &Labels::language("go"))
                .await
                .unwrap();
            reservation.runner().key
        };
        let runner = store.get_runner(&runner_key).await.unwrap();
        assert_eq!(runner.state, RunnerState::Idle);
    }

    #[tokio::test]
    async fn expired_reservations_are_swept() {
        let store = MemoryStore::new();
        store.upsert_runner(runner("http://10.0.0.6:8893", "go")).await.unwrap();
        let key = deployment(&store, "delta").await;

        let mut reservation = store
            .reserve_runner(&key, Duration::from_millis(1), &Labels::language("go"))
            .await
            .unwrap();
        let runner_key = reservation.runner().key;
        reservation.commit().await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.expire_runner_reservations().await.unwrap(), 1);
        let runner = store.get_runner(&runner_key).await.unwrap();
        assert_eq!(runner.state, RunnerState::Idle);
        assert_eq!(runner.deployment, None);
    }

    #[tokio::test]
    async fn reservation_respects_label_predicate() {
        let store = MemoryStore::new();
        store.upsert_runner(runner("http://10.0.0.7:8893", "kotlin")).await.unwrap();
        let key = deployment(&store, "epsilon").await;

        let err = store
            .reserve_runner(&key, Duration::from_secs(120), &Labels::language("go"))
            .await
            .map(|_| ())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn create_deployment_dedupes_identical_content() {
        let store = MemoryStore::new();
        let first = deployment(&store, "zeta").await;
        let second = deployment(&store, "zeta").await;
        assert_eq!(first, second);
        assert_eq!(store.list_deployments().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replace_deployment_swaps_the_active_target() {
        let store = MemoryStore::new();
        let old = deployment(&store, "eta").await;
        store.replace_deployment(&old, 2).await.unwrap();

        // Same module, different artefact content.
        let digest = store.create_artefact(Bytes::from_static(b"v2")).await.unwrap();
        let new = store
            .create_deployment(
                "go",
                module("eta"),
                vec![DeploymentArtefact {
                    digest,
                    path: "main".into(),
                    executable: true,
                }],
                vec![],
            )
            .await
            .unwrap();

        let mut notifications = store.subscribe();
        store.replace_deployment(&new, 2).await.unwrap();

        assert_eq!(store.get_deployment(&old).await.unwrap().min_replicas, 0);
        assert_eq!(store.get_deployment(&new).await.unwrap().min_replicas, 2);
        assert_eq!(
            store.active_deployment_for_module("eta").await.unwrap().map(|d| d.key),
            Some(new),
        );

        // Both sides of the swap are notified.
        let first = notifications.try_recv().unwrap();
        let second = notifications.try_recv().unwrap();
        assert_eq!(first.action, Action::Update);
        assert_eq!(first.new.unwrap().min_replicas, 0);
        assert_eq!(second.new.unwrap().min_replicas, 2);
    }

    #[tokio::test]
    async fn replacing_an_active_deployment_conflicts() {
        let store = MemoryStore::new();
        let key = deployment(&store, "theta").await;
        store.replace_deployment(&key, 1).await.unwrap();
        let err = store.replace_deployment(&key, 1).await.unwrap_err();
        assert_eq!(err.kind(), parallax_proto::ErrorKind::Conflict);

        // Scaling to zero through replace is allowed.
        store.replace_deployment(&key, 0).await.unwrap();
    }

    #[tokio::test]
    async fn reconciliation_reports_replica_deltas() {
        let store = MemoryStore::new();
        let key = deployment(&store, "iota").await;
        store.replace_deployment(&key, 2).await.unwrap();

        let rows = store.deployments_needing_reconciliation().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].deployment, key);
        assert_eq!(rows[0].assigned_replicas, 0);
        assert_eq!(rows[0].required_replicas, 2);

        let mut r = runner("http://10.0.0.8:8893", "go");
        r.state = RunnerState::Assigned;
        r.deployment = Some(key);
        store.upsert_runner(r.clone()).await.unwrap();
        let mut r2 = runner("http://10.0.0.9:8893", "go");
        r2.state = RunnerState::Assigned;
        r2.deployment = Some(key);
        store.upsert_runner(r2).await.unwrap();

        assert!(store.deployments_needing_reconciliation().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn routing_and_ingress_follow_assignment() {
        let store = MemoryStore::new();
        let key = deployment(&store, "kappa").await;
        store.replace_deployment(&key, 1).await.unwrap();

        assert!(store.routing_table("kappa").await.unwrap().is_empty());
        let mut r = runner("http://10.0.0.10:8893", "go");
        r.state = RunnerState::Assigned;
        r.deployment = Some(key);
        store.upsert_runner(r.clone()).await.unwrap();

        let routes = store.routing_table("kappa").await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].endpoint, r.endpoint);

        let ingress = store.get_ingress_routes("GET", "/kappa/status").await.unwrap();
        assert_eq!(ingress.len(), 1);
        assert_eq!(ingress[0].verb, "status");
        assert!(store.get_ingress_routes("POST", "/kappa/status").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_rows_are_reaped() {
        let store = MemoryStore::new();
        store.upsert_runner(runner("http://10.0.0.11:8893", "go")).await.unwrap();
        let controller = ControllerKey::generate();
        store.upsert_controller(&controller, "http://10.0.1.1:8892").await.unwrap();

        assert_eq!(store.kill_stale_runners(Duration::from_secs(60)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.kill_stale_runners(Duration::from_millis(1)).await.unwrap(), 1);
        assert_eq!(store.kill_stale_controllers(Duration::from_millis(1)).await.unwrap(), 1);
        assert!(store.list_runners().await.unwrap().is_empty());
        assert!(store.list_controllers().await.unwrap().is_empty());
    }
}
