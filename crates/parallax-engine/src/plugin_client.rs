//! Language plugin transport.
//!
//! [`PluginClient`] is the seam between the supervisor and a plugin process.
//! The wire implementation speaks length-prefixed JSON frames over TCP; the
//! fake implementation drives the same interface from tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use parallax_proto::frame;
use parallax_proto::language::{
    BuildContext, BuildEvent, BuildFailure, BuildOutcome, CustomDefaults, ModuleConfig,
    PluginRequest, PluginResponse,
};
use parallax_proto::schema::Module;

use crate::error::{EngineError, EngineResult};

/// Calls the supervisor makes against a plugin.
#[async_trait]
pub trait PluginClient: Send + Sync {
    async fn ping(&self) -> EngineResult<()>;

    async fn module_config_defaults(&self, dir: &Path) -> EngineResult<CustomDefaults>;

    async fn get_dependencies(&self, config: &ModuleConfig) -> EngineResult<Vec<String>>;

    async fn generate_stubs(
        &self,
        dir: &Path,
        module: &Module,
        config: &ModuleConfig,
    ) -> EngineResult<()>;

    async fn sync_stub_references(
        &self,
        config: &ModuleConfig,
        stubs_root: &Path,
        modules: &[String],
    ) -> EngineResult<()>;

    /// Open a build stream. The returned channel yields the build's events
    /// and, with `rebuild_automatically`, stays open for automatic rebuilds.
    async fn build(
        &self,
        project_root: &Path,
        stubs_root: &Path,
        rebuild_automatically: bool,
        context: BuildContext,
    ) -> EngineResult<mpsc::Receiver<BuildEvent>>;

    /// Push a new build context down an open build stream.
    async fn build_context_updated(&self, context: BuildContext) -> EngineResult<()>;
}

/// TCP client for a running plugin process.
pub struct WirePluginClient {
    module: String,
    addr: String,
}

impl WirePluginClient {
    #[must_use]
    pub fn new(module: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            addr: addr.into(),
        }
    }

    async fn unary(&self, request: &PluginRequest) -> EngineResult<PluginResponse> {
        let stream = TcpStream::connect(&self.addr).await?;
        let mut framed = frame::framed(stream);
        framed.send(frame::encode(request)?).await?;
        let Some(payload) = framed.next().await else {
            return Err(EngineError::plugin(
                &self.module,
                "connection closed before a response arrived",
            ));
        };
        let response: PluginResponse = frame::decode(&payload?)?;
        match response {
            PluginResponse::Error { error } => Err(error.into()),
            response => Ok(response),
        }
    }
}

#[async_trait]
impl PluginClient for WirePluginClient {
    async fn ping(&self) -> EngineResult<()> {
        match self.unary(&PluginRequest::Ping).await? {
            PluginResponse::Pong => Ok(()),
            other => Err(unexpected(&self.module, &other)),
        }
    }

    async fn module_config_defaults(&self, dir: &Path) -> EngineResult<CustomDefaults> {
        let request = PluginRequest::ModuleConfigDefaults {
            dir: dir.to_path_buf(),
        };
        match self.unary(&request).await? {
            PluginResponse::ModuleConfigDefaults { defaults } => Ok(defaults),
            other => Err(unexpected(&self.module, &other)),
        }
    }

    async fn get_dependencies(&self, config: &ModuleConfig) -> EngineResult<Vec<String>> {
        let request = PluginRequest::GetDependencies {
            config: config.clone(),
        };
        match self.unary(&request).await? {
            PluginResponse::Dependencies { modules } => Ok(modules),
            other => Err(unexpected(&self.module, &other)),
        }
    }

    async fn generate_stubs(
        &self,
        dir: &Path,
        module: &Module,
        config: &ModuleConfig,
    ) -> EngineResult<()> {
        let request = PluginRequest::GenerateStubs {
            dir: dir.to_path_buf(),
            module: module.clone(),
            config: config.clone(),
        };
        match self.unary(&request).await? {
            PluginResponse::Ack => Ok(()),
            other => Err(unexpected(&self.module, &other)),
        }
    }

    async fn sync_stub_references(
        &self,
        config: &ModuleConfig,
        stubs_root: &Path,
        modules: &[String],
    ) -> EngineResult<()> {
        let request = PluginRequest::SyncStubReferences {
            config: config.clone(),
            stubs_root: stubs_root.to_path_buf(),
            modules: modules.to_vec(),
        };
        match self.unary(&request).await? {
            PluginResponse::Ack => Ok(()),
            other => Err(unexpected(&self.module, &other)),
        }
    }

    async fn build(
        &self,
        project_root: &Path,
        stubs_root: &Path,
        rebuild_automatically: bool,
        context: BuildContext,
    ) -> EngineResult<mpsc::Receiver<BuildEvent>> {
        let request = PluginRequest::Build {
            project_root: project_root.to_path_buf(),
            stubs_root: stubs_root.to_path_buf(),
            rebuild_automatically,
            context,
        };
        let stream = TcpStream::connect(&self.addr).await?;
        let mut framed = frame::framed(stream);
        framed.send(frame::encode(&request)?).await?;

        let (tx, rx) = mpsc::channel(16);
        let module = self.module.clone();
        tokio::spawn(async move {
            while let Some(payload) = framed.next().await {
                let payload = match payload {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(module, error = %err, "plugin build stream failed");
                        break;
                    }
                };
                match frame::decode::<PluginResponse>(&payload) {
                    Ok(PluginResponse::BuildEvent { event }) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(PluginResponse::Error { error }) => {
                        warn!(module, error = %error, "plugin reported a stream error");
                        break;
                    }
                    Ok(other) => {
                        debug!(module, ?other, "ignoring non-event frame on build stream");
                    }
                    Err(err) => {
                        warn!(module, error = %err, "undecodable frame on build stream");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn build_context_updated(&self, context: BuildContext) -> EngineResult<()> {
        match self
            .unary(&PluginRequest::BuildContextUpdated { context })
            .await?
        {
            PluginResponse::Ack => Ok(()),
            other => Err(unexpected(&self.module, &other)),
        }
    }
}

fn unexpected(module: &str, response: &PluginResponse) -> EngineError {
    EngineError::plugin(module, format!("unexpected response: {response:?}"))
}

/// Scripted plugin for tests. In the default mode every build immediately
/// succeeds with the configured schema; `manual` hands the stream sender to
/// the test instead.
pub struct FakePluginClient {
    pub module: String,
    pub defaults: CustomDefaults,
    pub dependencies: Mutex<Vec<String>>,
    /// Schema returned on build success.
    pub schema: Mutex<Module>,
    /// Deploy files reported on build success.
    pub deploy_files: Mutex<Vec<String>>,
    /// Scripted failures consumed before builds start succeeding.
    pub failures: Mutex<VecDeque<BuildFailure>>,
    /// When set, builds do not respond on their own.
    pub manual: bool,
    contexts: Mutex<Vec<BuildContext>>,
    stream: Mutex<Option<mpsc::Sender<BuildEvent>>>,
}

impl FakePluginClient {
    #[must_use]
    pub fn new(module: &str) -> Arc<Self> {
        Arc::new(Self {
            module: module.to_owned(),
            defaults: CustomDefaults {
                deploy_dir: Some(".build".into()),
                watch: vec!["**/*".into()],
                ..CustomDefaults::default()
            },
            dependencies: Mutex::new(Vec::new()),
            schema: Mutex::new(Module::new(module)),
            deploy_files: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            manual: false,
            contexts: Mutex::new(Vec::new()),
            stream: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn manual(module: &str) -> Arc<Self> {
        let mut fake = Self::new(module);
        // Arc not shared yet, the flag is safe to flip.
        if let Some(fake) = Arc::get_mut(&mut fake) {
            fake.manual = true;
        }
        fake
    }

    /// Contexts received through `build` and `build_context_updated`.
    pub fn contexts(&self) -> Vec<BuildContext> {
        self.contexts.lock().clone()
    }

    /// Id of the most recently issued context.
    pub fn current_context_id(&self) -> Option<String> {
        self.contexts.lock().last().map(|c| c.id.clone())
    }

    /// Push an event down the open build stream.
    pub async fn send_event(&self, event: BuildEvent) {
        let sender = self.stream.lock().clone();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }

    fn respond(&self, context: &BuildContext, tx: &mpsc::Sender<BuildEvent>) {
        let event = match self.failures.lock().pop_front() {
            Some(mut failure) => {
                failure.context_id = context.id.clone();
                failure.is_automatic_rebuild = false;
                BuildEvent::BuildFailure(failure)
            }
            None => BuildEvent::BuildSuccess(BuildOutcome {
                context_id: context.id.clone(),
                is_automatic_rebuild: false,
                module: self.schema.lock().clone(),
                deploy_files: self.deploy_files.lock().clone(),
                errors: Vec::new(),
            }),
        };
        // Capacity 16 and the channel is fresh; this cannot fail.
        let _ = tx.try_send(event);
    }
}

#[async_trait]
impl PluginClient for FakePluginClient {
    async fn ping(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn module_config_defaults(&self, _dir: &Path) -> EngineResult<CustomDefaults> {
        Ok(self.defaults.clone())
    }

    async fn get_dependencies(&self, _config: &ModuleConfig) -> EngineResult<Vec<String>> {
        Ok(self.dependencies.lock().clone())
    }

    async fn generate_stubs(
        &self,
        _dir: &Path,
        _module: &Module,
        _config: &ModuleConfig,
    ) -> EngineResult<()> {
        Ok(())
    }

    async fn sync_stub_references(
        &self,
        _config: &ModuleConfig,
        _stubs_root: &Path,
        _modules: &[String],
    ) -> EngineResult<()> {
        Ok(())
    }

    async fn build(
        &self,
        _project_root: &Path,
        _stubs_root: &Path,
        _rebuild_automatically: bool,
        context: BuildContext,
    ) -> EngineResult<mpsc::Receiver<BuildEvent>> {
        let (tx, rx) = mpsc::channel(16);
        if !self.manual {
            self.respond(&context, &tx);
        }
        self.contexts.lock().push(context);
        *self.stream.lock() = Some(tx);
        Ok(rx)
    }

    async fn build_context_updated(&self, context: BuildContext) -> EngineResult<()> {
        let sender = self.stream.lock().clone();
        if !self.manual {
            if let Some(tx) = sender {
                self.respond(&context, &tx);
            }
        }
        self.contexts.lock().push(context);
        Ok(())
    }
}
