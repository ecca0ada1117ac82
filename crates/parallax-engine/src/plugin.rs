//! Language plugin supervision.
//!
//! One supervisor owns one plugin. It launches the plugin process, waits for
//! it to answer pings, and serialises builds through a command loop. Every
//! build is issued a fresh context id; results echoing any other id, or
//! carrying the wrong automatic-rebuild flag for what is pending, are stale
//! and get discarded. Automatic rebuilds the plugin starts on its own are
//! republished on the supervisor's update topic.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use parallax_proto::language::{
    BuildContext, BuildError, BuildErrorLevel, BuildEvent, CustomDefaults, LogLevel, ModuleConfig,
};
use parallax_proto::schema::Module;

use crate::error::{EngineError, EngineResult};
use crate::plugin_client::{PluginClient, WirePluginClient};

const TOPIC_CAPACITY: usize = 128;
const PID_FILE: &str = ".parallax-plugin.pid";
const PING_INTERVAL: Duration = Duration::from_millis(100);

/// Environment variables a plugin process is launched with.
pub const PLUGIN_BIND_ENV: &str = "PARALLAX_PLUGIN_BIND";
pub const PLUGIN_WORKING_DIR_ENV: &str = "PARALLAX_PLUGIN_WORKING_DIR";

/// The settled result of one build, success or not.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    /// Present on success.
    pub schema: Option<Module>,
    pub deploy_files: Vec<String>,
    pub errors: Vec<BuildError>,
    /// Set when the plugin asked for its dependency view to be re-resolved.
    pub invalidate_dependencies: bool,
}

impl BuildOutput {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.schema.is_some()
    }

    /// A single line summarising the error-level diagnostics.
    #[must_use]
    pub fn error_message(&self) -> String {
        let errors: Vec<&str> = self
            .errors
            .iter()
            .filter(|e| e.level == BuildErrorLevel::Error)
            .map(|e| e.msg.as_str())
            .collect();
        if errors.is_empty() {
            "build failed".to_owned()
        } else {
            errors.join("; ")
        }
    }
}

/// Events published by a supervisor for rebuilds its plugin started on its
/// own.
#[derive(Debug, Clone)]
pub enum PluginEvent {
    AutoRebuildStarted { module: String },
    AutoRebuildEnded { module: String, output: BuildOutput },
}

/// Everything a build needs besides the context id, which the supervisor
/// issues itself.
#[derive(Debug, Clone)]
pub struct BuildInputs {
    pub config: ModuleConfig,
    /// Schemas of all modules visible to the build.
    pub schema: Vec<Module>,
    pub dependencies: Vec<String>,
}

struct BuildCommand {
    project_root: PathBuf,
    stubs_root: PathBuf,
    rebuild_automatically: bool,
    inputs: BuildInputs,
    reply: oneshot::Sender<EngineResult<BuildOutput>>,
}

/// Settings for launching a plugin process.
#[derive(Debug, Clone)]
pub struct PluginSpawnSettings {
    pub module: String,
    pub language: String,
    pub working_dir: PathBuf,
    /// Address the plugin is told to bind its protocol socket on.
    pub bind: String,
    /// Extra environment handed to the process after the fixed variables.
    pub extra_env: Vec<(String, String)>,
    pub start_timeout: Duration,
    pub kill_timeout: Duration,
}

pub struct PluginSupervisor {
    module: String,
    client: Arc<dyn PluginClient>,
    commands: mpsc::Sender<BuildCommand>,
    updates: broadcast::Sender<PluginEvent>,
    cancel: CancellationToken,
    process: Mutex<Option<PluginProcess>>,
    kill_timeout: Duration,
}

impl PluginSupervisor {
    /// Launch the plugin binary for a language and wait for it to come up.
    pub async fn spawn(settings: PluginSpawnSettings) -> EngineResult<Arc<Self>> {
        let command = format!("parallax-language-{}", settings.language);
        let envs = launch_environment(&settings);
        let process =
            PluginProcess::start(&command, &settings.module, &settings.working_dir, &envs).await?;
        let client = Arc::new(WirePluginClient::new(
            settings.module.as_str(),
            settings.bind.as_str(),
        ));

        let deadline = Instant::now() + settings.start_timeout;
        loop {
            if client.ping().await.is_ok() {
                break;
            }
            if Instant::now() >= deadline {
                process.stop(settings.kill_timeout).await;
                return Err(EngineError::DeadlineExceeded(format!(
                    "plugin {command} did not answer within {:?}",
                    settings.start_timeout
                )));
            }
            tokio::time::sleep(PING_INTERVAL).await;
        }

        let supervisor = Self::for_client(&settings.module, client, settings.kill_timeout);
        *supervisor.process.lock() = Some(process);
        Ok(supervisor)
    }

    /// Supervise an already reachable client. Used by `spawn` and by tests
    /// with a fake client.
    #[must_use]
    pub fn for_client(
        module: &str,
        client: Arc<dyn PluginClient>,
        kill_timeout: Duration,
    ) -> Arc<Self> {
        let (commands, commands_rx) = mpsc::channel(16);
        let (updates, _) = broadcast::channel(TOPIC_CAPACITY);
        let cancel = CancellationToken::new();
        let supervisor = Arc::new(Self {
            module: module.to_owned(),
            client: Arc::clone(&client),
            commands,
            updates: updates.clone(),
            cancel: cancel.clone(),
            process: Mutex::new(None),
            kill_timeout,
        });
        tokio::spawn(run_loop(
            module.to_owned(),
            client,
            commands_rx,
            updates,
            cancel,
        ));
        supervisor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.updates.subscribe()
    }

    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Run one build and wait for its settled result.
    pub async fn build(
        &self,
        project_root: &Path,
        stubs_root: &Path,
        rebuild_automatically: bool,
        inputs: BuildInputs,
    ) -> EngineResult<BuildOutput> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(BuildCommand {
                project_root: project_root.to_path_buf(),
                stubs_root: stubs_root.to_path_buf(),
                rebuild_automatically,
                inputs,
                reply,
            })
            .await
            .map_err(|_| EngineError::plugin(&self.module, "supervisor has stopped"))?;
        rx.await
            .map_err(|_| EngineError::plugin(&self.module, "supervisor dropped the build"))?
    }

    pub async fn module_config_defaults(&self, dir: &Path) -> EngineResult<CustomDefaults> {
        self.client.module_config_defaults(dir).await
    }

    pub async fn get_dependencies(&self, config: &ModuleConfig) -> EngineResult<Vec<String>> {
        self.client.get_dependencies(config).await
    }

    pub async fn generate_stubs(
        &self,
        dir: &Path,
        module: &Module,
        config: &ModuleConfig,
    ) -> EngineResult<()> {
        self.client.generate_stubs(dir, module, config).await
    }

    pub async fn sync_stub_references(
        &self,
        config: &ModuleConfig,
        stubs_root: &Path,
        modules: &[String],
    ) -> EngineResult<()> {
        self.client
            .sync_stub_references(config, stubs_root, modules)
            .await
    }

    /// Stop the command loop and terminate the plugin process, SIGINT first,
    /// SIGKILL after the grace period.
    pub async fn kill(&self) {
        self.cancel.cancel();
        let process = self.process.lock().take();
        if let Some(process) = process {
            process.stop(self.kill_timeout).await;
        }
    }
}

async fn run_loop(
    module: String,
    client: Arc<dyn PluginClient>,
    mut commands: mpsc::Receiver<BuildCommand>,
    updates: broadcast::Sender<PluginEvent>,
    cancel: CancellationToken,
) {
    let mut counter: u64 = 0;
    let mut current_id: Option<String> = None;
    let mut stream: Option<mpsc::Receiver<BuildEvent>> = None;
    let mut streaming = false;
    let mut active: Option<oneshot::Sender<EngineResult<BuildOutput>>> = None;

    loop {
        let next_event = async {
            match stream.as_mut() {
                Some(stream) => stream.recv().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            command = commands.recv() => {
                let Some(command) = command else { break };
                if active.is_some() {
                    let _ = command.reply.send(Err(EngineError::plugin(
                        &module,
                        "a build is already in progress",
                    )));
                    continue;
                }
                counter += 1;
                let id = format!("{module}-{counter}");
                let context = BuildContext {
                    id: id.clone(),
                    config: command.inputs.config,
                    schema: command.inputs.schema,
                    dependencies: command.inputs.dependencies,
                };
                current_id = Some(id);
                if streaming && stream.is_some() {
                    match client.build_context_updated(context).await {
                        Ok(()) => active = Some(command.reply),
                        Err(err) => {
                            let _ = command.reply.send(Err(err));
                        }
                    }
                } else {
                    match client
                        .build(
                            &command.project_root,
                            &command.stubs_root,
                            command.rebuild_automatically,
                            context,
                        )
                        .await
                    {
                        Ok(rx) => {
                            stream = Some(rx);
                            streaming = command.rebuild_automatically;
                            active = Some(command.reply);
                        }
                        Err(err) => {
                            let _ = command.reply.send(Err(err));
                        }
                    }
                }
            }
            event = next_event => {
                match event {
                    None => {
                        stream = None;
                        streaming = false;
                        if let Some(reply) = active.take() {
                            let _ = reply.send(Err(EngineError::plugin(
                                &module,
                                "plugin stopped during the build",
                            )));
                        }
                    }
                    Some(BuildEvent::LogMessage { level, message }) => match level {
                        LogLevel::Debug => debug!(module, "{message}"),
                        LogLevel::Info => info!(module, "{message}"),
                        LogLevel::Warn => warn!(module, "{message}"),
                        LogLevel::Error => error!(module, "{message}"),
                    },
                    Some(BuildEvent::AutoRebuildStarted { context_id }) => {
                        if current_id.as_deref() == Some(context_id.as_str()) {
                            let _ = updates.send(PluginEvent::AutoRebuildStarted {
                                module: module.clone(),
                            });
                        } else {
                            debug!(module, context_id, "discarding stale auto-rebuild start");
                        }
                    }
                    Some(BuildEvent::BuildSuccess(outcome)) => {
                        let output = BuildOutput {
                            schema: Some(outcome.module),
                            deploy_files: outcome.deploy_files,
                            errors: outcome.errors,
                            invalidate_dependencies: false,
                        };
                        settle(
                            &module,
                            &updates,
                            &current_id,
                            &mut active,
                            &outcome_identity(&outcome.context_id, outcome.is_automatic_rebuild),
                            output,
                        );
                    }
                    Some(BuildEvent::BuildFailure(failure)) => {
                        let output = BuildOutput {
                            schema: None,
                            deploy_files: Vec::new(),
                            errors: failure.errors,
                            invalidate_dependencies: failure.invalidate_dependencies,
                        };
                        settle(
                            &module,
                            &updates,
                            &current_id,
                            &mut active,
                            &outcome_identity(&failure.context_id, failure.is_automatic_rebuild),
                            output,
                        );
                    }
                }
            }
        }
    }
}

/// The environment a plugin process launches with: the fixed variables
/// first, then the caller's extras in order.
fn launch_environment(settings: &PluginSpawnSettings) -> Vec<(String, String)> {
    let mut envs = vec![
        (PLUGIN_BIND_ENV.to_owned(), settings.bind.clone()),
        (
            PLUGIN_WORKING_DIR_ENV.to_owned(),
            settings.working_dir.display().to_string(),
        ),
    ];
    envs.extend(settings.extra_env.iter().cloned());
    envs
}

struct OutcomeIdentity {
    context_id: String,
    is_automatic_rebuild: bool,
}

fn outcome_identity(context_id: &str, is_automatic_rebuild: bool) -> OutcomeIdentity {
    OutcomeIdentity {
        context_id: context_id.to_owned(),
        is_automatic_rebuild,
    }
}

/// Route a settled build result: reply to the pending explicit build, or
/// republish an automatic rebuild. Anything else is stale and dropped.
fn settle(
    module: &str,
    updates: &broadcast::Sender<PluginEvent>,
    current_id: &Option<String>,
    active: &mut Option<oneshot::Sender<EngineResult<BuildOutput>>>,
    identity: &OutcomeIdentity,
    output: BuildOutput,
) {
    if current_id.as_deref() != Some(identity.context_id.as_str()) {
        debug!(
            module,
            context_id = identity.context_id,
            "discarding build result for a superseded context",
        );
        return;
    }
    match (active.is_some(), identity.is_automatic_rebuild) {
        (true, false) => {
            if let Some(reply) = active.take() {
                let _ = reply.send(Ok(output));
            }
        }
        (true, true) => {
            debug!(
                module,
                "discarding automatic result while an explicit build is pending",
            );
        }
        (false, true) => {
            let _ = updates.send(PluginEvent::AutoRebuildEnded {
                module: module.to_owned(),
                output,
            });
        }
        (false, false) => {
            debug!(module, "discarding unsolicited explicit build result");
        }
    }
}

/// A running plugin subprocess. A pid file in the working directory lets the
/// next engine run reap a plugin an earlier run leaked.
struct PluginProcess {
    child: tokio::process::Child,
    pid_file: PathBuf,
}

impl PluginProcess {
    async fn start(
        command: &str,
        module: &str,
        working_dir: &Path,
        envs: &[(String, String)],
    ) -> EngineResult<Self> {
        let pid_file = working_dir.join(PID_FILE);
        reap_stale(&pid_file);
        let mut child = tokio::process::Command::new(command)
            .current_dir(working_dir)
            .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(pid) = child.id() {
            std::fs::write(&pid_file, pid.to_string())?;
        }
        if let Some(stderr) = child.stderr.take() {
            let module = module.to_owned();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(module, "{line}");
                }
            });
        }
        Ok(Self { child, pid_file })
    }

    async fn stop(mut self, grace: Duration) {
        if let Some(pid) = self.child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGINT);
        }
        if tokio::time::timeout(grace, self.child.wait()).await.is_err() {
            let _ = self.child.kill().await;
        }
        let _ = std::fs::remove_file(&self.pid_file);
    }
}

fn reap_stale(pid_file: &Path) {
    let Ok(raw) = std::fs::read_to_string(pid_file) else {
        return;
    };
    if let Ok(pid) = raw.trim().parse::<i32>() {
        match kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) => warn!(pid, "reaped a plugin left behind by a previous run"),
            Err(nix::errno::Errno::ESRCH) => {}
            Err(err) => warn!(pid, error = %err, "could not reap stale plugin"),
        }
    }
    let _ = std::fs::remove_file(pid_file);
}
