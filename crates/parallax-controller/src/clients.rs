//! Runner clients and the endpoint-keyed client pool.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;

use parallax_proto::runner::{
    headers, CallMetadata, CallRequest, CallResponse, DeployRequest, ReserveRequest,
    TerminateRequest, TerminateResponse,
};
use parallax_proto::{DeploymentKey, RunnerState, VerbRef, WireError};

use crate::error::{ControllerError, ControllerResult};

/// Everything the controller asks of a runner.
#[async_trait]
pub trait RunnerClient: Send + Sync {
    async fn ping(&self) -> ControllerResult<()>;

    /// Ask the runner to hold itself for `deployment`.
    async fn reserve(&self, deployment: &DeploymentKey) -> ControllerResult<()>;

    /// Ask a reserved runner to download and start `deployment`.
    async fn deploy(&self, deployment: &DeploymentKey) -> ControllerResult<()>;

    /// Stop `deployment`; the runner reports the state it settled in.
    async fn terminate(&self, deployment: &DeploymentKey) -> ControllerResult<RunnerState>;

    /// Invoke a verb on the runner.
    async fn call(
        &self,
        verb: &VerbRef,
        body: serde_json::Value,
        metadata: &CallMetadata,
    ) -> ControllerResult<serde_json::Value>;
}

/// HTTP runner client.
pub struct HttpRunnerClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRunnerClient {
    #[must_use]
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: endpoint.trim_end_matches('/').to_owned(),
        }
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl serde::Serialize,
    ) -> ControllerResult<T> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            let err: WireError = response.json().await?;
            Err(ControllerError::Remote(err))
        }
    }
}

#[async_trait]
impl RunnerClient for HttpRunnerClient {
    async fn ping(&self) -> ControllerResult<()> {
        self.client
            .get(format!("{}/ping", self.base_url))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn reserve(&self, deployment: &DeploymentKey) -> ControllerResult<()> {
        let _: serde_json::Value = self
            .post_json(
                "/reserve",
                &ReserveRequest {
                    deployment: *deployment,
                },
            )
            .await?;
        Ok(())
    }

    async fn deploy(&self, deployment: &DeploymentKey) -> ControllerResult<()> {
        let _: serde_json::Value = self
            .post_json(
                "/deploy",
                &DeployRequest {
                    deployment: *deployment,
                },
            )
            .await?;
        Ok(())
    }

    async fn terminate(&self, deployment: &DeploymentKey) -> ControllerResult<RunnerState> {
        let response: TerminateResponse = self
            .post_json(
                "/terminate",
                &TerminateRequest {
                    deployment: *deployment,
                },
            )
            .await?;
        Ok(response.state)
    }

    async fn call(
        &self,
        verb: &VerbRef,
        body: serde_json::Value,
        metadata: &CallMetadata,
    ) -> ControllerResult<serde_json::Value> {
        let mut request = self
            .client
            .post(format!("{}/call", self.base_url))
            .header(headers::VERB, verb.to_string())
            .json(&CallRequest {
                verb: verb.clone(),
                body,
            });
        if let Some(request_id) = &metadata.request_id {
            request = request.header(headers::REQUEST_ID, request_id);
        }
        if let Some(direct) = &metadata.direct_routing {
            request = request.header(headers::DIRECT_ROUTING, direct);
        }
        let response = request.send().await?;
        if response.status().is_success() {
            let call: CallResponse = response.json().await?;
            Ok(call.body)
        } else {
            let err: WireError = response.json().await?;
            Err(ControllerError::Remote(err))
        }
    }
}

type ClientFactory = Box<dyn Fn(&str) -> Arc<dyn RunnerClient> + Send + Sync>;

/// Lazy pool of runner clients keyed by endpoint. Entries are created on
/// first use and never evicted; clients are cheap and endpoints few.
pub struct ClientPool {
    clients: RwLock<HashMap<String, Arc<dyn RunnerClient>>>,
    factory: ClientFactory,
}

impl Default for ClientPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientPool {
    /// Pool producing HTTP clients.
    #[must_use]
    pub fn new() -> Self {
        Self::with_factory(Box::new(|endpoint| Arc::new(HttpRunnerClient::new(endpoint))))
    }

    /// Pool with a custom client constructor, used by tests to install
    /// mock runners.
    #[must_use]
    pub fn with_factory(factory: ClientFactory) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            factory,
        }
    }

    /// The client for `endpoint`, constructing it on first use.
    pub fn for_endpoint(&self, endpoint: &str) -> Arc<dyn RunnerClient> {
        if let Some(client) = self.clients.read().get(endpoint) {
            return Arc::clone(client);
        }
        let mut clients = self.clients.write();
        Arc::clone(
            clients
                .entry(endpoint.to_owned())
                .or_insert_with(|| (self.factory)(endpoint)),
        )
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

/// Mock runner client for testing.
pub struct MockRunnerClient {
    /// When set, `reserve` fails with this message.
    pub fail_reserve: parking_lot::Mutex<Option<String>>,
    /// When set, `deploy` fails with this message.
    pub fail_deploy: parking_lot::Mutex<Option<String>>,
    /// State returned from `terminate`.
    pub terminate_state: parking_lot::Mutex<RunnerState>,
    /// Recorded operations, in order.
    pub log: parking_lot::Mutex<Vec<String>>,
}

impl MockRunnerClient {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_reserve: parking_lot::Mutex::new(None),
            fail_deploy: parking_lot::Mutex::new(None),
            terminate_state: parking_lot::Mutex::new(RunnerState::Idle),
            log: parking_lot::Mutex::new(Vec::new()),
        })
    }

    fn record(&self, op: &str, deployment: &DeploymentKey) {
        self.log.lock().push(format!("{op} {deployment}"));
    }

    #[must_use]
    pub fn operations(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl RunnerClient for MockRunnerClient {
    async fn ping(&self) -> ControllerResult<()> {
        Ok(())
    }

    async fn reserve(&self, deployment: &DeploymentKey) -> ControllerResult<()> {
        self.record("reserve", deployment);
        if let Some(message) = self.fail_reserve.lock().clone() {
            return Err(ControllerError::Unavailable(message));
        }
        Ok(())
    }

    async fn deploy(&self, deployment: &DeploymentKey) -> ControllerResult<()> {
        self.record("deploy", deployment);
        if let Some(message) = self.fail_deploy.lock().clone() {
            return Err(ControllerError::Unavailable(message));
        }
        Ok(())
    }

    async fn terminate(&self, deployment: &DeploymentKey) -> ControllerResult<RunnerState> {
        self.record("terminate", deployment);
        Ok(*self.terminate_state.lock())
    }

    async fn call(
        &self,
        verb: &VerbRef,
        body: serde_json::Value,
        _metadata: &CallMetadata,
    ) -> ControllerResult<serde_json::Value> {
        self.log.lock().push(format!("call {verb}"));
        Ok(body)
    }
}
