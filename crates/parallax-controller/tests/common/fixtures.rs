//! Test fixtures for controller integration tests.
//!
//! `TestCluster` wires a controller, reconciler and mock runner fleet
//! together. Runners are mocks behind the client pool; their heartbeat
//! behaviour is simulated explicitly by the tests via `ack_deploys`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use parallax_controller::{
    ClientPool, Controller, ControllerConfig, MockRunnerClient, Reconciler, ReservationManager,
    RunnerClient,
};
use parallax_proto::controller::{CreateDeploymentRequest, DeploymentArtefact};
use parallax_proto::runner::RunnerHeartbeat;
use parallax_proto::schema::{Ingress, Module, TypeRef, Verb};
use parallax_proto::{DeploymentKey, Labels, RunnerKey, RunnerState};
use parallax_store::{MemoryStore, StateStore};

pub struct TestCluster {
    pub store: Arc<dyn StateStore>,
    pub pool: Arc<ClientPool>,
    pub controller: Arc<Controller>,
    pub reconciler: Reconciler,
    mocks: Arc<Mutex<HashMap<String, Arc<MockRunnerClient>>>>,
    acked: Mutex<HashMap<String, usize>>,
    next_host: AtomicU32,
}

impl TestCluster {
    pub fn new() -> Self {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let mocks: Arc<Mutex<HashMap<String, Arc<MockRunnerClient>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let factory_mocks = Arc::clone(&mocks);
        let pool = Arc::new(ClientPool::with_factory(Box::new(move |endpoint| {
            let mock = MockRunnerClient::new();
            factory_mocks
                .lock()
                .insert(endpoint.to_owned(), Arc::clone(&mock));
            mock as Arc<dyn RunnerClient>
        })));
        let config = ControllerConfig::default();
        let controller = Arc::new(Controller::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            config.clone(),
        ));
        let reconciler = Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            ReservationManager::new(
                Arc::clone(&store),
                Arc::clone(&pool),
                config.runners.reservation_timeout,
            ),
            config.scheduling.reconcile_interval,
        );
        Self {
            store,
            pool,
            controller,
            reconciler,
            mocks,
            acked: Mutex::new(HashMap::new()),
            next_host: AtomicU32::new(1),
        }
    }

    /// Register an idle runner and return its key and endpoint.
    pub async fn add_runner(&self, language: &str) -> (RunnerKey, String) {
        let host = self.next_host.fetch_add(1, Ordering::Relaxed);
        let key = RunnerKey::generate();
        let endpoint = format!("http://10.1.0.{host}:8893");
        self.controller
            .register_runner(RunnerHeartbeat {
                key,
                endpoint: endpoint.clone(),
                state: RunnerState::Idle,
                labels: Labels::language(language),
                deployment: None,
                error: None,
            })
            .await
            .unwrap();
        (key, endpoint)
    }

    /// Upload an artefact and create a deployment for `module`.
    pub async fn create_deployment(
        &self,
        module: &str,
        language: &str,
        content: &[u8],
    ) -> DeploymentKey {
        let digest = self
            .controller
            .upload_artefact(Bytes::copy_from_slice(content))
            .await
            .unwrap();
        self.controller
            .create_deployment(CreateDeploymentRequest {
                language: language.into(),
                schema: module_schema(module),
                artefacts: vec![DeploymentArtefact {
                    digest,
                    path: "main".into(),
                    executable: true,
                }],
            })
            .await
            .unwrap()
    }

    /// The mock behind `endpoint`, creating it if the pool has not touched
    /// the endpoint yet.
    pub fn mock(&self, endpoint: &str) -> Arc<MockRunnerClient> {
        let _ = self.pool.for_endpoint(endpoint);
        Arc::clone(self.mocks.lock().get(endpoint).unwrap())
    }

    /// Simulate runner heartbeats acknowledging dispatched deploys: every
    /// unacked `deploy` recorded by a mock flips its runner to ASSIGNED.
    pub async fn ack_deploys(&self) {
        let mocks: Vec<(String, Arc<MockRunnerClient>)> = self
            .mocks
            .lock()
            .iter()
            .map(|(endpoint, mock)| (endpoint.clone(), Arc::clone(mock)))
            .collect();
        for (endpoint, mock) in mocks {
            let ops = mock.operations();
            let mut acked = self.acked.lock();
            let start = *acked.get(&endpoint).unwrap_or(&0);
            acked.insert(endpoint.clone(), ops.len());
            drop(acked);
            for op in &ops[start..] {
                let Some(key) = op.strip_prefix("deploy ") else {
                    continue;
                };
                let deployment: DeploymentKey = key.parse().unwrap();
                let Some(mut runner) = self
                    .store
                    .list_runners()
                    .await
                    .unwrap()
                    .into_iter()
                    .find(|r| r.endpoint == endpoint)
                else {
                    continue;
                };
                runner.state = RunnerState::Assigned;
                runner.deployment = Some(deployment);
                runner.last_seen = chrono::Utc::now();
                self.store.upsert_runner(runner).await.unwrap();
            }
        }
    }

    /// Tick the reconciler and apply simulated runner acknowledgements.
    pub async fn reconcile_round(&self) {
        self.reconciler.tick().await;
        self.ack_deploys().await;
    }

    /// All operations recorded across the fleet, for quiescence checks.
    pub fn total_operations(&self) -> usize {
        self.mocks
            .lock()
            .values()
            .map(|mock| mock.operations().len())
            .sum()
    }

}

/// A schema with one ingress verb, named after the module.
pub fn module_schema(module: &str) -> Module {
    let mut schema = Module::new(module);
    schema.verbs.push(Verb {
        name: "handle".into(),
        request: TypeRef::local("Request"),
        response: TypeRef::local("Response"),
        ingress: Some(Ingress {
            method: "GET".into(),
            path: format!("/{module}"),
        }),
    });
    schema
}
