//! Controller transport for the engine.
//!
//! The engine only needs a narrow slice of the controller API: artefact
//! transfer, deployment management, status and the schema stream. The HTTP
//! implementation polls `/v1/schema` and diffs locally to synthesise change
//! events; the fake implementation backs engine tests.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use parallax_proto::controller::{
    ArtefactDiffRequest, ArtefactDiffResponse, CreateDeploymentRequest, CreateDeploymentResponse,
    DeploymentStatus, PingResponse, ReplaceDeployRequest, SchemaChange, SchemaChangeType,
    StatusResponse, UploadArtefactResponse,
};
use parallax_proto::schema::Module;
use parallax_proto::{DeploymentKey, Digest, WireError};

use crate::error::{EngineError, EngineResult};

#[async_trait]
pub trait ControllerClient: Send + Sync {
    async fn ping(&self) -> EngineResult<PingResponse>;

    /// Which of `digests` the controller does not hold yet.
    async fn get_artefact_diffs(&self, digests: Vec<Digest>) -> EngineResult<Vec<Digest>>;

    async fn upload_artefact(&self, content: Bytes) -> EngineResult<Digest>;

    async fn create_deployment(
        &self,
        request: CreateDeploymentRequest,
    ) -> EngineResult<DeploymentKey>;

    async fn replace_deploy(&self, key: &DeploymentKey, min_replicas: u32) -> EngineResult<()>;

    async fn status(&self) -> EngineResult<StatusResponse>;

    /// Subscribe to schema changes. Events arrive in batches ordered by
    /// module name, `more` false on the last event of each batch.
    async fn pull_schema(&self) -> EngineResult<mpsc::Receiver<SchemaChange>>;

    /// The active deployment for a module, if any.
    async fn active_deployment(&self, module: &str) -> EngineResult<Option<DeploymentStatus>> {
        Ok(self
            .status()
            .await?
            .deployments
            .into_iter()
            .find(|d| d.module == module && d.min_replicas > 0))
    }
}

pub struct HttpControllerClient {
    client: reqwest::Client,
    base_url: String,
    schema_poll: Duration,
}

impl HttpControllerClient {
    #[must_use]
    pub fn new(base_url: impl Into<String>, schema_poll: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            schema_poll,
        }
    }

    async fn get_json<R: DeserializeOwned>(&self, path: &str) -> EngineResult<R> {
        let url = format!("{}{path}", self.base_url);
        let response = self.client.get(url).send().await?;
        Self::decode(response).await
    }

    async fn post_json<T: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
    ) -> EngineResult<R> {
        let url = format!("{}{path}", self.base_url);
        let response = self.client.post(url).json(body).send().await?;
        Self::decode(response).await
    }

    async fn decode<R: DeserializeOwned>(response: reqwest::Response) -> EngineResult<R> {
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            let error: WireError = response.json().await?;
            Err(error.into())
        }
    }
}

#[async_trait]
impl ControllerClient for HttpControllerClient {
    async fn ping(&self) -> EngineResult<PingResponse> {
        self.get_json("/ping").await
    }

    async fn get_artefact_diffs(&self, digests: Vec<Digest>) -> EngineResult<Vec<Digest>> {
        let response: ArtefactDiffResponse = self
            .post_json("/v1/artefacts/diff", &ArtefactDiffRequest { digests })
            .await?;
        Ok(response.missing)
    }

    async fn upload_artefact(&self, content: Bytes) -> EngineResult<Digest> {
        let url = format!("{}/v1/artefacts", self.base_url);
        let response = self.client.post(url).body(content).send().await?;
        let response: UploadArtefactResponse = Self::decode(response).await?;
        Ok(response.digest)
    }

    async fn create_deployment(
        &self,
        request: CreateDeploymentRequest,
    ) -> EngineResult<DeploymentKey> {
        let response: CreateDeploymentResponse =
            self.post_json("/v1/deployments", &request).await?;
        Ok(response.key)
    }

    async fn replace_deploy(&self, key: &DeploymentKey, min_replicas: u32) -> EngineResult<()> {
        let url = format!("{}/v1/deployments/{key}/replace", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&ReplaceDeployRequest { min_replicas })
            .send()
            .await?;
        // Success carries an empty body.
        if response.status().is_success() {
            Ok(())
        } else {
            let error: WireError = response.json().await?;
            Err(error.into())
        }
    }

    async fn status(&self) -> EngineResult<StatusResponse> {
        self.get_json("/v1/status").await
    }

    async fn pull_schema(&self) -> EngineResult<mpsc::Receiver<SchemaChange>> {
        let (tx, rx) = mpsc::channel(64);
        let client = self.client.clone();
        let url = format!("{}/v1/schema", self.base_url);
        let poll = self.schema_poll;
        tokio::spawn(async move {
            let mut known: HashMap<String, (DeploymentKey, Digest)> = HashMap::new();
            loop {
                let snapshot: Vec<SchemaChange> = match fetch(&client, &url).await {
                    Ok(snapshot) => snapshot,
                    Err(err) => {
                        warn!(error = %err, "schema poll failed");
                        tokio::time::sleep(poll).await;
                        continue;
                    }
                };
                let batch = diff_snapshot(&mut known, snapshot);
                for change in batch {
                    if tx.send(change).await.is_err() {
                        return;
                    }
                }
                tokio::time::sleep(poll).await;
            }
        });
        Ok(rx)
    }
}

async fn fetch(client: &reqwest::Client, url: &str) -> EngineResult<Vec<SchemaChange>> {
    let response = client.get(url).send().await?;
    HttpControllerClient::decode(response).await
}

/// Turn a full snapshot into the change batch relative to `known`, with
/// `more` flags applied.
fn diff_snapshot(
    known: &mut HashMap<String, (DeploymentKey, Digest)>,
    snapshot: Vec<SchemaChange>,
) -> Vec<SchemaChange> {
    let mut batch = Vec::new();
    let mut seen = HashMap::new();
    for mut change in snapshot {
        let Some(schema) = change.schema.take() else {
            continue;
        };
        let digest = schema.digest();
        let entry = (change.deployment, digest);
        match known.get(&change.module_name) {
            None => {
                batch.push(SchemaChange {
                    change: SchemaChangeType::Added,
                    module_name: change.module_name.clone(),
                    deployment: change.deployment,
                    schema: Some(schema),
                    more: true,
                });
            }
            Some(prev) if *prev != entry => {
                batch.push(SchemaChange {
                    change: SchemaChangeType::Changed,
                    module_name: change.module_name.clone(),
                    deployment: change.deployment,
                    schema: Some(schema),
                    more: true,
                });
            }
            Some(_) => {}
        }
        seen.insert(change.module_name, entry);
    }
    for (module, (deployment, _)) in known.iter() {
        if !seen.contains_key(module) {
            batch.push(SchemaChange {
                change: SchemaChangeType::Removed,
                module_name: module.clone(),
                deployment: *deployment,
                schema: None,
                more: true,
            });
        }
    }
    *known = seen;
    batch.sort_by(|a, b| a.module_name.cmp(&b.module_name));
    if let Some(last) = batch.last_mut() {
        last.more = false;
    }
    batch
}

struct DeploymentRecord {
    key: DeploymentKey,
    module: String,
    language: String,
    min_replicas: u32,
    schema: Module,
}

/// In-memory controller for engine tests.
#[derive(Default)]
pub struct FakeControllerClient {
    artefacts: Mutex<HashSet<Digest>>,
    deployments: Mutex<Vec<DeploymentRecord>>,
    operations: Mutex<Vec<String>>,
    schema_senders: Mutex<Vec<mpsc::Sender<SchemaChange>>>,
}

impl FakeControllerClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything the engine asked of the controller, in order.
    pub fn operations(&self) -> Vec<String> {
        self.operations.lock().clone()
    }

    /// Schema of the active deployment for `module`, if one exists.
    pub fn active_schema(&self, module: &str) -> Option<Module> {
        self.deployments
            .lock()
            .iter()
            .find(|d| d.module == module && d.min_replicas > 0)
            .map(|d| d.schema.clone())
    }

    /// Push a schema change to every subscriber.
    pub async fn push_schema_change(&self, change: SchemaChange) {
        let senders = self.schema_senders.lock().clone();
        for sender in senders {
            let _ = sender.send(change.clone()).await;
        }
    }

    fn record(&self, op: String) {
        self.operations.lock().push(op);
    }
}

#[async_trait]
impl ControllerClient for FakeControllerClient {
    async fn ping(&self) -> EngineResult<PingResponse> {
        Ok(PingResponse::default())
    }

    async fn get_artefact_diffs(&self, digests: Vec<Digest>) -> EngineResult<Vec<Digest>> {
        let artefacts = self.artefacts.lock();
        Ok(digests
            .into_iter()
            .filter(|d| !artefacts.contains(d))
            .collect())
    }

    async fn upload_artefact(&self, content: Bytes) -> EngineResult<Digest> {
        let digest = Digest::of(&content);
        self.artefacts.lock().insert(digest);
        self.record(format!("upload {digest}"));
        Ok(digest)
    }

    async fn create_deployment(
        &self,
        request: CreateDeploymentRequest,
    ) -> EngineResult<DeploymentKey> {
        let key = DeploymentKey::generate();
        self.deployments.lock().push(DeploymentRecord {
            key,
            module: request.schema.name.clone(),
            language: request.language,
            min_replicas: 0,
            schema: request.schema,
        });
        self.record(format!("create {key}"));
        Ok(key)
    }

    async fn replace_deploy(&self, key: &DeploymentKey, min_replicas: u32) -> EngineResult<()> {
        let mut deployments = self.deployments.lock();
        let Some(position) = deployments.iter().position(|d| &d.key == key) else {
            return Err(EngineError::NotFound(format!("deployment {key}")));
        };
        let module = deployments[position].module.clone();
        if min_replicas > 0 {
            for other in deployments.iter_mut() {
                if other.module == module {
                    other.min_replicas = 0;
                }
            }
        }
        deployments[position].min_replicas = min_replicas;
        drop(deployments);
        self.record(format!("replace {key} {min_replicas}"));
        Ok(())
    }

    async fn status(&self) -> EngineResult<StatusResponse> {
        let deployments = self
            .deployments
            .lock()
            .iter()
            .map(|d| DeploymentStatus {
                key: d.key,
                name: d.module.clone(),
                module: d.module.clone(),
                language: d.language.clone(),
                min_replicas: d.min_replicas,
                // Replicas come up instantly in tests.
                assigned_replicas: d.min_replicas,
            })
            .collect();
        Ok(StatusResponse {
            deployments,
            ..StatusResponse::default()
        })
    }

    async fn pull_schema(&self) -> EngineResult<mpsc::Receiver<SchemaChange>> {
        let (tx, rx) = mpsc::channel(64);
        self.schema_senders.lock().push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parallax_proto::schema::{TypeRef, Verb};

    fn schema(module: &str, verb: &str) -> Module {
        let mut schema = Module::new(module);
        schema.verbs.push(Verb {
            name: verb.into(),
            request: TypeRef::local("Request"),
            response: TypeRef::local("Response"),
            ingress: None,
        });
        schema
    }

    fn snapshot_entry(module: &str, verb: &str, key: DeploymentKey) -> SchemaChange {
        SchemaChange {
            change: SchemaChangeType::Added,
            module_name: module.into(),
            deployment: key,
            schema: Some(schema(module, verb)),
            more: true,
        }
    }

    #[test]
    fn snapshot_diffs_synthesise_batches() {
        let mut known = HashMap::new();
        let alpha = DeploymentKey::generate();
        let beta = DeploymentKey::generate();

        let batch = diff_snapshot(
            &mut known,
            vec![
                snapshot_entry("alpha", "a", alpha),
                snapshot_entry("beta", "b", beta),
            ],
        );
        assert_eq!(batch.len(), 2);
        assert!(batch[0].more);
        assert!(!batch[1].more);
        assert!(batch.iter().all(|c| c.change == SchemaChangeType::Added));

        // Same snapshot again: no changes.
        let batch = diff_snapshot(
            &mut known,
            vec![
                snapshot_entry("alpha", "a", alpha),
                snapshot_entry("beta", "b", beta),
            ],
        );
        assert!(batch.is_empty());

        // A new verb changes alpha; beta disappears.
        let batch = diff_snapshot(&mut known, vec![snapshot_entry("alpha", "a2", alpha)]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].change, SchemaChangeType::Changed);
        assert_eq!(batch[0].module_name, "alpha");
        assert_eq!(batch[1].change, SchemaChangeType::Removed);
        assert_eq!(batch[1].deployment, beta);
        assert!(!batch[1].more);
    }
}
