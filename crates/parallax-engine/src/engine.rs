//! The build engine.
//!
//! Owns one plugin supervisor per module, builds modules in dependency
//! order with bounded parallelism, deploys the results and, in dev mode,
//! rebuilds on filesystem and schema changes. All activity is reported on a
//! single event topic; an idle debounce brackets bursts of activity with
//! `EngineStarted` and `EngineEnded`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parallax_proto::controller::{SchemaChange, SchemaChangeType};
use parallax_proto::language::ModuleConfig;
use parallax_proto::schema::{Module, BUILTIN_MODULE};

use crate::config::EngineConfig;
use crate::controller_client::ControllerClient;
use crate::deploy;
use crate::discovery::discover_modules;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, RawEngineEvent};
use crate::graph::topological_groups;
use crate::moduleconfig::UnvalidatedModuleConfig;
use crate::plugin::{BuildInputs, PluginEvent, PluginSpawnSettings, PluginSupervisor};
use crate::watch::{WatchEvent, Watcher};

const TOPIC_CAPACITY: usize = 256;
const STUBS_DIR: &str = ".parallax/stubs";
const DEV_REPLICAS: u32 = 1;

/// Builds a supervisor for a freshly discovered module.
pub type PluginFactory = Box<
    dyn Fn(&UnvalidatedModuleConfig) -> BoxFuture<'static, EngineResult<Arc<PluginSupervisor>>>
        + Send
        + Sync,
>;

/// Per-module state the engine tracks between builds.
#[derive(Clone)]
pub struct ModuleMeta {
    pub config: ModuleConfig,
    pub plugin: Arc<PluginSupervisor>,
    pub schema: Option<Module>,
    pub dependencies: Vec<String>,
    pub deploy_files: Vec<String>,
}

pub struct Engine {
    controller: Arc<dyn ControllerClient>,
    config: EngineConfig,
    project_root: PathBuf,
    module_roots: Vec<PathBuf>,
    metas: Arc<DashMap<String, ModuleMeta>>,
    /// Schemas of modules deployed by others, keyed by module name.
    remote: DashMap<String, Module>,
    watcher: Watcher,
    raw: mpsc::Sender<RawEngineEvent>,
    topic: broadcast::Sender<EngineEvent>,
    plugin_factory: PluginFactory,
    group_limit: Arc<Semaphore>,
    watching: AtomicBool,
}

impl Engine {
    /// An engine that launches real plugin processes.
    #[must_use]
    pub fn new(
        controller: Arc<dyn ControllerClient>,
        config: EngineConfig,
        project_root: PathBuf,
        module_roots: Vec<PathBuf>,
    ) -> Arc<Self> {
        let plugin = config.plugin.clone();
        let factory: PluginFactory = Box::new(move |unvalidated| {
            let module = unvalidated.module.clone();
            let language = unvalidated.language.clone();
            let working_dir = unvalidated.dir.clone();
            let plugin = plugin.clone();
            Box::pin(async move {
                let bind = reserve_bind_addr()?;
                PluginSupervisor::spawn(PluginSpawnSettings {
                    module,
                    language,
                    working_dir,
                    bind,
                    extra_env: plugin
                        .env
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                    start_timeout: plugin.start_timeout,
                    kill_timeout: plugin.kill_timeout,
                })
                .await
            })
        });
        Self::with_plugin_factory(controller, config, project_root, module_roots, factory)
    }

    /// An engine with an injected plugin factory. Tests supply fakes here.
    #[must_use]
    pub fn with_plugin_factory(
        controller: Arc<dyn ControllerClient>,
        config: EngineConfig,
        project_root: PathBuf,
        module_roots: Vec<PathBuf>,
        plugin_factory: PluginFactory,
    ) -> Arc<Self> {
        let (raw, raw_rx) = mpsc::channel(TOPIC_CAPACITY);
        let (topic, _) = broadcast::channel(TOPIC_CAPACITY);
        tokio::spawn(fan_in(raw_rx, topic.clone(), config.idle_debounce));
        let group_limit = Arc::new(Semaphore::new(config.parallelism.max(1)));
        Arc::new(Self {
            controller,
            config,
            project_root,
            module_roots,
            metas: Arc::new(DashMap::new()),
            remote: DashMap::new(),
            watcher: Watcher::new(),
            raw,
            topic,
            plugin_factory,
            group_limit,
            watching: AtomicBool::new(false),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.topic.subscribe()
    }

    /// Names of the modules the engine currently tracks, sorted.
    #[must_use]
    pub fn modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self.metas.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn meta(&self, module: &str) -> Option<ModuleMeta> {
        self.metas.get(module).map(|m| m.clone())
    }

    async fn emit(&self, event: RawEngineEvent) {
        let _ = self.raw.send(event).await;
    }

    /// Discover modules under the roots and register any new ones.
    pub async fn discover_and_add(&self) -> EngineResult<Vec<String>> {
        let discovered = discover_modules(&self.module_roots)?;
        let mut names = Vec::with_capacity(discovered.len());
        for config in discovered {
            names.push(config.module.clone());
            if !self.metas.contains_key(&config.module) {
                self.add_module(config).await?;
            }
        }
        Ok(names)
    }

    /// Register a module: launch its plugin, resolve its configuration and
    /// dependencies.
    pub async fn add_module(&self, unvalidated: UnvalidatedModuleConfig) -> EngineResult<String> {
        let module = unvalidated.module.clone();
        let plugin = (self.plugin_factory)(&unvalidated).await?;
        let defaults = plugin.module_config_defaults(&unvalidated.dir).await?;
        let config = unvalidated.fill_defaults(&defaults)?;
        let dependencies = plugin.get_dependencies(&config).await?;
        spawn_plugin_forwarder(Arc::clone(&self.metas), self.raw.clone(), plugin.subscribe());
        self.metas.insert(
            module.clone(),
            ModuleMeta {
                config,
                plugin,
                schema: None,
                dependencies,
                deploy_files: Vec::new(),
            },
        );
        info!(module, "module registered");
        self.emit(RawEngineEvent::ModuleAdded {
            module: module.clone(),
        })
        .await;
        Ok(module)
    }

    /// Drop a module: terminate its deployment, stop its plugin.
    pub async fn remove_module(&self, module: &str) -> EngineResult<()> {
        let Some((_, meta)) = self.metas.remove(module) else {
            return Ok(());
        };
        deploy::terminate_module_deployment(self.controller.as_ref(), module).await?;
        meta.plugin.kill().await;
        info!(module, "module removed");
        self.emit(RawEngineEvent::ModuleRemoved {
            module: module.to_owned(),
        })
        .await;
        Ok(())
    }

    pub async fn build(&self, modules: &[String]) -> EngineResult<()> {
        self.build_with(modules, None).await
    }

    pub async fn build_and_deploy(
        &self,
        modules: &[String],
        min_replicas: u32,
        wait: bool,
    ) -> EngineResult<()> {
        self.build_with(modules, Some((min_replicas, wait))).await
    }

    async fn build_with(
        &self,
        modules: &[String],
        deploy: Option<(u32, bool)>,
    ) -> EngineResult<()> {
        // Re-resolve dependencies of the requested modules; manifests may
        // have changed since registration.
        for name in modules {
            let meta = self
                .metas
                .get(name)
                .map(|m| m.clone())
                .ok_or_else(|| EngineError::NotFound(format!("module {name}")))?;
            let dependencies = meta.plugin.get_dependencies(&meta.config).await?;
            if let Some(mut meta) = self.metas.get_mut(name) {
                meta.dependencies = dependencies;
            }
        }

        let graph = self.local_graph();
        let groups = topological_groups(&graph)?;
        let to_build = dependency_closure(modules, &graph);

        // Every dependency must resolve locally, from a remote deployment's
        // schema, or be the builtin module.
        for member in &to_build {
            for dep in graph.get(member).into_iter().flatten() {
                if graph.contains_key(dep)
                    || self.remote.contains_key(dep)
                    || dep.as_str() == BUILTIN_MODULE
                {
                    continue;
                }
                return Err(EngineError::NotFound(format!(
                    "module {dep}, required by {member}"
                )));
            }
        }

        for module in &to_build {
            self.emit(RawEngineEvent::ModuleBuildWaiting {
                module: module.clone(),
            })
            .await;
        }

        let mut failed: HashSet<String> = HashSet::new();
        for group in &groups {
            let mut runnable = Vec::new();
            for member in group {
                if !to_build.contains(member) {
                    continue;
                }
                let broken_dep = graph
                    .get(member)
                    .into_iter()
                    .flatten()
                    .find(|dep| failed.contains(*dep));
                if let Some(dep) = broken_dep {
                    failed.insert(member.clone());
                    self.emit(RawEngineEvent::ModuleBuildFailed {
                        module: member.clone(),
                        is_auto_rebuild: false,
                        error: format!("dependency {dep} failed to build"),
                    })
                    .await;
                } else {
                    runnable.push(member.clone());
                }
            }
            let results =
                futures::future::join_all(runnable.iter().map(|m| self.build_module(m))).await;
            for (member, result) in runnable.iter().zip(results) {
                match result {
                    Ok(()) => {}
                    Err(EngineError::BuildFailed { .. }) => {
                        failed.insert(member.clone());
                    }
                    Err(err) => {
                        failed.insert(member.clone());
                        self.emit(RawEngineEvent::ModuleBuildFailed {
                            module: member.clone(),
                            is_auto_rebuild: false,
                            error: err.to_string(),
                        })
                        .await;
                    }
                }
            }
        }

        if let Some((min_replicas, wait)) = deploy {
            for group in &groups {
                for member in group {
                    if !to_build.contains(member) || failed.contains(member) {
                        continue;
                    }
                    if self.deploy_module(member, min_replicas, wait).await.is_err() {
                        failed.insert(member.clone());
                    }
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            let mut names: Vec<String> = failed.into_iter().collect();
            names.sort();
            Err(EngineError::BuildFailed {
                module: names.join(", "),
                message: "not all modules built and deployed".into(),
            })
        }
    }

    async fn build_module(&self, module: &str) -> EngineResult<()> {
        let _permit = self
            .group_limit
            .acquire()
            .await
            .map_err(|_| EngineError::Internal("build semaphore closed".into()))?;
        let meta = self
            .metas
            .get(module)
            .map(|m| m.clone())
            .ok_or_else(|| EngineError::NotFound(format!("module {module}")))?;

        let txn = self.watcher.transaction(&meta.config.dir);
        let stubs_root = self.project_root.join(STUBS_DIR);
        let mut stub_modules = Vec::new();
        for dep in &meta.dependencies {
            if let Some(schema) = self.schema_for(dep) {
                let dir = stubs_root.join(dep);
                meta.plugin.generate_stubs(&dir, &schema, &meta.config).await?;
                stub_modules.push(dep.clone());
            }
        }
        if !stub_modules.is_empty() {
            meta.plugin
                .sync_stub_references(&meta.config, &stubs_root, &stub_modules)
                .await?;
        }

        let mut dependencies = meta.dependencies.clone();
        let mut invalidated = false;
        loop {
            self.emit(RawEngineEvent::ModuleBuildStarted {
                module: module.to_owned(),
                is_auto_rebuild: false,
            })
            .await;
            let inputs = BuildInputs {
                config: meta.config.clone(),
                schema: self.visible_schemas(),
                dependencies: dependencies.clone(),
            };
            let output = meta
                .plugin
                .build(
                    &self.project_root,
                    &stubs_root,
                    self.watching.load(Ordering::SeqCst),
                    inputs,
                )
                .await?;

            if output.succeeded() {
                let deploy_dir = meta.config.abs_deploy_dir();
                let outputs: Vec<PathBuf> =
                    output.deploy_files.iter().map(|f| deploy_dir.join(f)).collect();
                if let Err(err) = txn.modified_files(&outputs) {
                    warn!(module, error = %err, "could not absorb build output hashes");
                }
                if let Some(mut meta) = self.metas.get_mut(module) {
                    meta.schema = output.schema.clone();
                    meta.deploy_files = output.deploy_files.clone();
                    meta.dependencies = dependencies;
                }
                self.emit(RawEngineEvent::ModuleBuildSuccess {
                    module: module.to_owned(),
                    is_auto_rebuild: false,
                })
                .await;
                return Ok(());
            }

            if output.invalidate_dependencies && !invalidated {
                // Soft failure: the plugin's dependency view was stale.
                // Re-resolve and retry once, without reporting a failure.
                debug!(module, "dependencies invalidated, retrying the build");
                invalidated = true;
                dependencies = meta.plugin.get_dependencies(&meta.config).await?;
                if let Some(mut meta) = self.metas.get_mut(module) {
                    meta.dependencies = dependencies.clone();
                }
                continue;
            }

            let error = output.error_message();
            self.emit(RawEngineEvent::ModuleBuildFailed {
                module: module.to_owned(),
                is_auto_rebuild: false,
                error: error.clone(),
            })
            .await;
            return Err(EngineError::BuildFailed {
                module: module.to_owned(),
                message: error,
            });
        }
    }

    async fn deploy_module(
        &self,
        module: &str,
        min_replicas: u32,
        wait: bool,
    ) -> EngineResult<()> {
        let meta = self
            .metas
            .get(module)
            .map(|m| m.clone())
            .ok_or_else(|| EngineError::NotFound(format!("module {module}")))?;
        let Some(schema) = meta.schema else {
            return Err(EngineError::Config(format!(
                "module {module} has not built successfully yet"
            )));
        };
        self.emit(RawEngineEvent::ModuleDeployStarted {
            module: module.to_owned(),
        })
        .await;
        let result = deploy::deploy_module(
            self.controller.as_ref(),
            &meta.config,
            &schema,
            &meta.deploy_files,
            min_replicas,
            wait,
            &self.config.deploy,
        )
        .await;
        match result {
            Ok(_) => {
                self.emit(RawEngineEvent::ModuleDeploySuccess {
                    module: module.to_owned(),
                })
                .await;
                Ok(())
            }
            Err(err) => {
                self.emit(RawEngineEvent::ModuleDeployFailed {
                    module: module.to_owned(),
                    error: err.to_string(),
                })
                .await;
                Err(err)
            }
        }
    }

    /// Build, deploy and keep rebuilding on changes until cancelled.
    pub async fn dev(self: Arc<Self>, cancel: CancellationToken) -> EngineResult<()> {
        self.watching.store(true, Ordering::SeqCst);
        let mut watch_rx = self.watcher.subscribe();
        let mut engine_rx = self.topic.subscribe();

        self.discover_and_add().await?;
        let modules = self.modules();
        if let Err(err) = self.build_and_deploy(&modules, DEV_REPLICAS, false).await {
            warn!(error = %err, "initial build did not fully succeed; watching for fixes");
        }
        self.watcher
            .watch(cancel.clone(), self.config.watch.period, self.module_roots.clone())?;
        let mut schema_rx = self.controller.pull_schema().await?;
        let mut pending_schema: Vec<SchemaChange> = Vec::new();

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = watch_rx.recv() => {
                    match event {
                        Ok(event) => self.handle_watch_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "watch events lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                change = schema_rx.recv() => {
                    let Some(change) = change else {
                        warn!("schema stream closed");
                        break;
                    };
                    let more = change.more;
                    pending_schema.push(change);
                    if !more {
                        let batch = std::mem::take(&mut pending_schema);
                        self.apply_schema_batch(batch).await;
                    }
                }
                event = engine_rx.recv() => {
                    if let Ok(EngineEvent::ModuleBuildSuccess { module, is_auto_rebuild: true }) = event {
                        let _ = self.deploy_module(&module, DEV_REPLICAS, false).await;
                    }
                }
            }
        }

        let plugins: Vec<Arc<PluginSupervisor>> =
            self.metas.iter().map(|e| Arc::clone(&e.value().plugin)).collect();
        for plugin in plugins {
            plugin.kill().await;
        }
        Ok(())
    }

    async fn handle_watch_event(&self, event: WatchEvent) {
        match event {
            WatchEvent::ModuleAdded(config) => {
                let module = config.module.clone();
                if self.metas.contains_key(&module) {
                    return;
                }
                match self.add_module(config).await {
                    Ok(_) => {
                        let _ = self
                            .build_and_deploy(&[module], DEV_REPLICAS, false)
                            .await;
                    }
                    Err(err) => warn!(module, error = %err, "could not register new module"),
                }
            }
            WatchEvent::ModuleRemoved(config) => {
                if let Err(err) = self.remove_module(&config.module).await {
                    warn!(module = config.module, error = %err, "module removal failed");
                }
            }
            WatchEvent::ModuleChanged { config, path, .. } => {
                let module = config.module.clone();
                if !self.metas.contains_key(&module) {
                    return;
                }
                debug!(module, path = %path.display(), "source change detected");
                let _ = self.build_and_deploy(&[module], DEV_REPLICAS, false).await;
            }
        }
    }

    /// Apply one batch of schema changes from the controller and rebuild any
    /// local module depending on a module whose schema moved.
    async fn apply_schema_batch(&self, batch: Vec<SchemaChange>) {
        let mut moved: BTreeSet<String> = BTreeSet::new();
        for change in batch {
            // Local modules are authoritative here; remote echoes of our own
            // deployments carry no new information.
            if self.metas.contains_key(&change.module_name) {
                continue;
            }
            match change.change {
                SchemaChangeType::Added | SchemaChangeType::Changed => {
                    let Some(schema) = change.schema else { continue };
                    let digest = schema.digest();
                    let previous = self.remote.insert(change.module_name.clone(), schema);
                    if previous.map(|p| p.digest()) != Some(digest) {
                        moved.insert(change.module_name);
                    }
                }
                SchemaChangeType::Removed => {
                    if self.remote.remove(&change.module_name).is_some() {
                        moved.insert(change.module_name);
                    }
                }
            }
        }
        if moved.is_empty() {
            return;
        }
        let dirty: Vec<String> = self
            .metas
            .iter()
            .filter(|e| e.value().dependencies.iter().any(|d| moved.contains(d)))
            .map(|e| e.key().clone())
            .collect();
        if !dirty.is_empty() {
            debug!(?dirty, "rebuilding dependents of changed remote schemas");
            let _ = self.build_and_deploy(&dirty, DEV_REPLICAS, false).await;
        }
    }

    fn local_graph(&self) -> HashMap<String, Vec<String>> {
        self.metas
            .iter()
            .map(|e| (e.key().clone(), e.value().dependencies.clone()))
            .collect()
    }

    fn schema_for(&self, module: &str) -> Option<Module> {
        if let Some(meta) = self.metas.get(module) {
            return meta.schema.clone();
        }
        self.remote.get(module).map(|s| s.clone())
    }

    /// All schemas currently known, local builds and remote deployments,
    /// sorted by module name.
    fn visible_schemas(&self) -> Vec<Module> {
        let mut schemas: Vec<Module> = self
            .metas
            .iter()
            .filter_map(|e| e.value().schema.clone())
            .collect();
        for entry in self.remote.iter() {
            if !self.metas.contains_key(entry.key()) {
                schemas.push(entry.value().clone());
            }
        }
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }
}

/// The requested modules plus their transitive local dependencies.
fn dependency_closure(
    modules: &[String],
    graph: &HashMap<String, Vec<String>>,
) -> BTreeSet<String> {
    let mut closure = BTreeSet::new();
    let mut queue: Vec<&String> = modules.iter().collect();
    while let Some(module) = queue.pop() {
        if !graph.contains_key(module) || !closure.insert(module.clone()) {
            continue;
        }
        if let Some(deps) = graph.get(module) {
            queue.extend(deps.iter());
        }
    }
    closure
}

/// Reserve an ephemeral local port for a plugin to bind.
fn reserve_bind_addr() -> EngineResult<String> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.to_string())
}

/// Republish a plugin's automatic rebuild activity as engine events and keep
/// module metadata current.
fn spawn_plugin_forwarder(
    metas: Arc<DashMap<String, ModuleMeta>>,
    raw: mpsc::Sender<RawEngineEvent>,
    mut updates: broadcast::Receiver<PluginEvent>,
) {
    tokio::spawn(async move {
        loop {
            let event = match updates.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match event {
                PluginEvent::AutoRebuildStarted { module } => {
                    let _ = raw
                        .send(RawEngineEvent::ModuleBuildStarted {
                            module,
                            is_auto_rebuild: true,
                        })
                        .await;
                }
                PluginEvent::AutoRebuildEnded { module, output } => {
                    if output.succeeded() {
                        if let Some(mut meta) = metas.get_mut(&module) {
                            meta.schema = output.schema.clone();
                            meta.deploy_files = output.deploy_files.clone();
                        }
                        let _ = raw
                            .send(RawEngineEvent::ModuleBuildSuccess {
                                module,
                                is_auto_rebuild: true,
                            })
                            .await;
                    } else {
                        let _ = raw
                            .send(RawEngineEvent::ModuleBuildFailed {
                                module,
                                is_auto_rebuild: true,
                                error: output.error_message(),
                            })
                            .await;
                    }
                }
            }
        }
    });
}

/// Fold raw activity into the public stream. Tracks how many builds and
/// deploys are in flight; the idle edge is debounced before `EngineEnded`
/// goes out with the latest per-module errors.
async fn fan_in(
    mut raw: mpsc::Receiver<RawEngineEvent>,
    topic: broadcast::Sender<EngineEvent>,
    debounce: std::time::Duration,
) {
    let mut explicit_builds: u32 = 0;
    let mut auto_rebuilds: u32 = 0;
    let mut deploys: u32 = 0;
    let mut errors: HashMap<String, String> = HashMap::new();
    let mut running = false;
    let mut idle_at: Option<Instant> = None;

    loop {
        let deadline = idle_at.unwrap_or_else(Instant::now);
        tokio::select! {
            biased;
            event = raw.recv() => {
                let Some(event) = event else { break };
                let public = apply(
                    event,
                    &mut explicit_builds,
                    &mut auto_rebuilds,
                    &mut deploys,
                    &mut errors,
                );
                let busy = explicit_builds + auto_rebuilds + deploys > 0;
                if busy {
                    idle_at = None;
                    if !running {
                        running = true;
                        let _ = topic.send(EngineEvent::EngineStarted);
                    }
                }
                let _ = topic.send(public);
                if !busy && running {
                    idle_at = Some(Instant::now() + debounce);
                }
            }
            () = tokio::time::sleep_until(deadline), if idle_at.is_some() => {
                idle_at = None;
                running = false;
                let _ = topic.send(EngineEvent::EngineEnded {
                    module_errors: errors.clone(),
                });
            }
        }
    }
}

fn apply(
    event: RawEngineEvent,
    explicit_builds: &mut u32,
    auto_rebuilds: &mut u32,
    deploys: &mut u32,
    errors: &mut HashMap<String, String>,
) -> EngineEvent {
    match event {
        RawEngineEvent::ModuleAdded { module } => EngineEvent::ModuleAdded { module },
        RawEngineEvent::ModuleRemoved { module } => {
            errors.remove(&module);
            EngineEvent::ModuleRemoved { module }
        }
        RawEngineEvent::ModuleBuildWaiting { module } => EngineEvent::ModuleBuildWaiting { module },
        RawEngineEvent::ModuleBuildStarted {
            module,
            is_auto_rebuild,
        } => {
            if is_auto_rebuild {
                *auto_rebuilds += 1;
            } else {
                *explicit_builds += 1;
            }
            EngineEvent::ModuleBuildStarted {
                module,
                is_auto_rebuild,
            }
        }
        RawEngineEvent::ModuleBuildSuccess {
            module,
            is_auto_rebuild,
        } => {
            if is_auto_rebuild {
                *auto_rebuilds = auto_rebuilds.saturating_sub(1);
            } else {
                *explicit_builds = explicit_builds.saturating_sub(1);
            }
            errors.remove(&module);
            EngineEvent::ModuleBuildSuccess {
                module,
                is_auto_rebuild,
            }
        }
        RawEngineEvent::ModuleBuildFailed {
            module,
            is_auto_rebuild,
            error,
        } => {
            if is_auto_rebuild {
                *auto_rebuilds = auto_rebuilds.saturating_sub(1);
            } else {
                *explicit_builds = explicit_builds.saturating_sub(1);
            }
            errors.insert(module.clone(), error.clone());
            EngineEvent::ModuleBuildFailed {
                module,
                is_auto_rebuild,
                error,
            }
        }
        RawEngineEvent::ModuleDeployStarted { module } => {
            *deploys += 1;
            EngineEvent::ModuleDeployStarted { module }
        }
        RawEngineEvent::ModuleDeploySuccess { module } => {
            *deploys = deploys.saturating_sub(1);
            errors.remove(&module);
            EngineEvent::ModuleDeploySuccess { module }
        }
        RawEngineEvent::ModuleDeployFailed { module, error } => {
            *deploys = deploys.saturating_sub(1);
            errors.insert(module.clone(), error.clone());
            EngineEvent::ModuleDeployFailed { module, error }
        }
    }
}
