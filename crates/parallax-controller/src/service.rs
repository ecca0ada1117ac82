//! The controller service.
//!
//! Implements the RPC surface the API layer exposes: artefact transfer,
//! deployment lifecycle, runner registration, verb calls and cluster status.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tracing::{debug, info};

use parallax_proto::controller::{
    ArtefactChunk, ControllerStatus, CreateDeploymentRequest, DeploymentStatus,
    IngressRouteStatus, PingResponse, RouteStatus, RunnerStatus, StatusResponse,
};
use parallax_proto::runner::{CallMetadata, RunnerHeartbeat};
use parallax_proto::{ControllerKey, Digest, DeploymentKey, RunnerState, VerbRef};
use parallax_store::{Deployment, IngressRouteSpec, Runner, StateStore};

use crate::artefact::ArtefactReader;
use crate::clients::ClientPool;
use crate::config::ControllerConfig;
use crate::error::{ControllerError, ControllerResult};

pub struct Controller {
    key: ControllerKey,
    endpoint: String,
    store: Arc<dyn StateStore>,
    pool: Arc<ClientPool>,
    config: ControllerConfig,
}

impl Controller {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, pool: Arc<ClientPool>, config: ControllerConfig) -> Self {
        let endpoint = config
            .api
            .advertise
            .clone()
            .unwrap_or_else(|| format!("http://{}", config.api.listen_addr));
        Self {
            key: ControllerKey::generate(),
            endpoint,
            store,
            pool,
            config,
        }
    }

    #[must_use]
    pub const fn key(&self) -> ControllerKey {
        self.key
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Which of `digests` are not yet stored.
    pub async fn get_artefact_diffs(&self, digests: Vec<Digest>) -> ControllerResult<Vec<Digest>> {
        Ok(self.store.get_missing_artefacts(&digests).await?)
    }

    pub async fn upload_artefact(&self, content: Bytes) -> ControllerResult<Digest> {
        let digest = self.store.create_artefact(content).await?;
        debug!(%digest, "artefact stored");
        Ok(digest)
    }

    /// Create a deployment from a built module. Ingress routes are derived
    /// from the schema's verb metadata here, so the store never re-parses
    /// schemas.
    pub async fn create_deployment(
        &self,
        request: CreateDeploymentRequest,
    ) -> ControllerResult<DeploymentKey> {
        if request.language.is_empty() {
            return Err(ControllerError::InvalidArgument(
                "deployment language is required".into(),
            ));
        }
        let ingress: Vec<_> = request
            .schema
            .verbs
            .iter()
            .filter_map(|verb| {
                verb.ingress.as_ref().map(|ingress| IngressRouteSpec {
                    method: ingress.method.clone(),
                    path: ingress.path.clone(),
                    verb: verb.name.clone(),
                })
            })
            .collect();
        let key = self
            .store
            .create_deployment(&request.language, request.schema, request.artefacts, ingress)
            .await?;
        info!(deployment = %key, "deployment created");
        Ok(key)
    }

    pub async fn replace_deploy(
        &self,
        key: &DeploymentKey,
        min_replicas: u32,
    ) -> ControllerResult<()> {
        self.store.replace_deployment(key, min_replicas).await?;
        info!(deployment = %key, min_replicas, "deployment replica target replaced");
        Ok(())
    }

    pub async fn get_deployment(&self, key: &DeploymentKey) -> ControllerResult<Deployment> {
        Ok(self.store.get_deployment(key).await?)
    }

    pub async fn active_deployment_for_module(
        &self,
        module: &str,
    ) -> ControllerResult<Option<Deployment>> {
        Ok(self.store.active_deployment_for_module(module).await?)
    }

    /// Stream the artefacts of a deployment as bounded chunks, file by file.
    pub async fn get_deployment_artefacts(
        &self,
        key: &DeploymentKey,
    ) -> ControllerResult<mpsc::Receiver<ControllerResult<ArtefactChunk>>> {
        let deployment = self.store.get_deployment(key).await?;
        let (tx, rx) = mpsc::channel(16);
        let store = Arc::clone(&self.store);
        let chunk_size = self.config.scheduling.artefact_chunk_size;
        tokio::spawn(async move {
            for artefact in deployment.artefacts {
                let content = match store.get_artefact(&artefact.digest).await {
                    Ok(content) => content,
                    Err(err) => {
                        let _ = tx.send(Err(err.into())).await;
                        return;
                    }
                };
                let reader = ArtefactReader::new(artefact, content, chunk_size);
                for chunk in reader {
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }

    /// Register or refresh a runner from its heartbeat.
    pub async fn register_runner(&self, heartbeat: RunnerHeartbeat) -> ControllerResult<()> {
        if let Some(error) = &heartbeat.error {
            debug!(runner = %heartbeat.key, error, "runner reported an error");
        }
        let runner = Runner {
            key: heartbeat.key,
            endpoint: heartbeat.endpoint,
            state: heartbeat.state,
            labels: heartbeat.labels,
            deployment: heartbeat.deployment,
            last_seen: chrono::Utc::now(),
        };
        self.store.upsert_runner(runner).await?;
        Ok(())
    }

    /// Route a verb call to a runner serving the verb's module.
    pub async fn call(
        &self,
        verb: &VerbRef,
        body: serde_json::Value,
        metadata: &CallMetadata,
    ) -> ControllerResult<serde_json::Value> {
        let endpoint = match &metadata.direct_routing {
            Some(endpoint) => endpoint.clone(),
            None => {
                let routes = self.store.routing_table(&verb.module).await?;
                routes
                    .choose(&mut rand::thread_rng())
                    .map(|route| route.endpoint.clone())
                    .ok_or_else(|| {
                        ControllerError::Unavailable(format!(
                            "no runners are serving module {}",
                            verb.module,
                        ))
                    })?
            }
        };
        let client = self.pool.for_endpoint(&endpoint);
        client.call(verb, body, metadata).await
    }

    pub async fn status(&self) -> ControllerResult<StatusResponse> {
        let controllers = self.store.list_controllers().await?;
        let runners = self.store.list_runners().await?;
        let deployments = self.store.list_deployments().await?;
        let routes = self.store.list_routes().await?;
        let ingress_routes = self.store.list_ingress_routes().await?;

        let mut assigned: HashMap<DeploymentKey, u32> = HashMap::new();
        for runner in &runners {
            if runner.state == RunnerState::Assigned {
                if let Some(deployment) = runner.deployment {
                    *assigned.entry(deployment).or_default() += 1;
                }
            }
        }

        Ok(StatusResponse {
            controllers: controllers
                .into_iter()
                .map(|c| ControllerStatus {
                    key: c.key,
                    endpoint: c.endpoint,
                    last_seen: c.last_seen,
                })
                .collect(),
            runners: runners
                .into_iter()
                .map(|r| RunnerStatus {
                    key: r.key,
                    endpoint: r.endpoint,
                    state: r.state,
                    labels: r.labels,
                    deployment: r.deployment,
                })
                .collect(),
            deployments: deployments
                .into_iter()
                .map(|d| DeploymentStatus {
                    assigned_replicas: assigned.get(&d.key).copied().unwrap_or(0),
                    key: d.key,
                    name: d.name,
                    module: d.module,
                    language: d.language,
                    min_replicas: d.min_replicas,
                })
                .collect(),
            routes: routes
                .into_iter()
                .map(|r| RouteStatus {
                    module: r.module,
                    deployment: r.deployment,
                    runner: r.runner,
                    endpoint: r.endpoint,
                })
                .collect(),
            ingress_routes: ingress_routes
                .into_iter()
                .map(|r| IngressRouteStatus {
                    method: r.method,
                    path: r.path,
                    module: r.module,
                    verb: r.verb,
                    deployment: r.deployment,
                })
                .collect(),
        })
    }

    /// Readiness probe. The store is the only hard dependency.
    pub async fn ping(&self) -> PingResponse {
        match self.store.list_controllers().await {
            Ok(_) => PingResponse::default(),
            Err(err) => PingResponse {
                not_ready: Some(err.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parallax_proto::controller::DeploymentArtefact;
    use parallax_proto::schema::{Ingress, Module, TypeRef, Verb};
    use parallax_proto::Labels;
    use parallax_store::MemoryStore;

    fn controller() -> Controller {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let pool = Arc::new(ClientPool::with_factory(Box::new(|_| {
            crate::clients::MockRunnerClient::new() as Arc<dyn crate::clients::RunnerClient>
        })));
        Controller::new(store, pool, ControllerConfig::default())
    }

    fn time_module() -> Module {
        let mut module = Module::new("time");
        module.verbs.push(Verb {
            name: "now".into(),
            request: TypeRef::local("TimeRequest"),
            response: TypeRef::local("TimeResponse"),
            ingress: Some(Ingress {
                method: "GET".into(),
                path: "/time".into(),
            }),
        });
        module
    }

    #[tokio::test]
    async fn deploy_round_trip_with_artefact_diffs() {
        let controller = controller();
        let content = Bytes::from_static(b"time module binary");
        let digest = Digest::of(&content);

        // First diff reports the artefact missing; after upload it is known.
        let missing = controller.get_artefact_diffs(vec![digest]).await.unwrap();
        assert_eq!(missing, vec![digest]);
        controller.upload_artefact(content).await.unwrap();
        assert!(controller.get_artefact_diffs(vec![digest]).await.unwrap().is_empty());

        let key = controller
            .create_deployment(CreateDeploymentRequest {
                language: "go".into(),
                schema: time_module(),
                artefacts: vec![DeploymentArtefact {
                    digest,
                    path: "main".into(),
                    executable: true,
                }],
            })
            .await
            .unwrap();
        controller.replace_deploy(&key, 1).await.unwrap();

        let status = controller.status().await.unwrap();
        assert_eq!(status.deployments.len(), 1);
        assert_eq!(status.deployments[0].min_replicas, 1);
        // Ingress routes were derived from the verb metadata.
        assert_eq!(status.ingress_routes.len(), 1);
        assert_eq!(status.ingress_routes[0].path, "/time");
        assert_eq!(status.ingress_routes[0].verb, "now");
    }

    #[tokio::test]
    async fn artefact_stream_marks_file_boundaries() {
        let controller = controller();
        let first = Bytes::from(vec![1u8; 3]);
        let second = Bytes::from(vec![2u8; 3]);
        let d1 = controller.upload_artefact(first.clone()).await.unwrap();
        let d2 = controller.upload_artefact(second.clone()).await.unwrap();

        let key = controller
            .create_deployment(CreateDeploymentRequest {
                language: "go".into(),
                schema: time_module(),
                artefacts: vec![
                    DeploymentArtefact {
                        digest: d1,
                        path: "main".into(),
                        executable: true,
                    },
                    DeploymentArtefact {
                        digest: d2,
                        path: "config.json".into(),
                        executable: false,
                    },
                ],
            })
            .await
            .unwrap();

        let mut rx = controller.get_deployment_artefacts(&key).await.unwrap();
        let mut digests = Vec::new();
        let mut bytes = Vec::new();
        while let Some(chunk) = rx.recv().await {
            let chunk = chunk.unwrap();
            digests.push(chunk.artefact.digest);
            bytes.extend_from_slice(&chunk.chunk);
        }
        // One chunk per file at the default chunk size; digest changes at
        // the file boundary.
        assert_eq!(digests, vec![d1, d2]);
        assert_eq!(bytes.len(), 6);
    }

    #[tokio::test]
    async fn heartbeat_registers_runner() {
        let controller = controller();
        let heartbeat = RunnerHeartbeat {
            key: parallax_proto::RunnerKey::generate(),
            endpoint: "http://10.0.0.1:8893".into(),
            state: RunnerState::Idle,
            labels: Labels::language("go"),
            deployment: None,
            error: None,
        };
        controller.register_runner(heartbeat.clone()).await.unwrap();
        let status = controller.status().await.unwrap();
        assert_eq!(status.runners.len(), 1);
        assert_eq!(status.runners[0].key, heartbeat.key);
    }

    #[tokio::test]
    async fn call_requires_a_route() {
        let controller = controller();
        let err = controller
            .call(
                &VerbRef::new("time", "now"),
                serde_json::json!({}),
                &CallMetadata::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), parallax_proto::ErrorKind::Unavailable);
    }
}
