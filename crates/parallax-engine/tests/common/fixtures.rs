//! Test fixtures for build engine integration tests.
//!
//! `TestProject` is a temporary project directory with scripted plugins and
//! an in-memory controller behind the engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use parallax_engine::{
    ControllerClient, Engine, EngineConfig, EngineEvent, FakeControllerClient, FakePluginClient,
    PluginSupervisor, MODULE_MANIFEST,
};

pub struct TestProject {
    pub root: tempfile::TempDir,
    pub controller: Arc<FakeControllerClient>,
    pub engine: Arc<Engine>,
    fakes: Arc<Mutex<HashMap<String, Arc<FakePluginClient>>>>,
}

impl TestProject {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let controller = Arc::new(FakeControllerClient::new());
        let fakes: Arc<Mutex<HashMap<String, Arc<FakePluginClient>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let factory_fakes = Arc::clone(&fakes);
        let factory: parallax_engine::PluginFactory =
            Box::new(move |config: &parallax_engine::UnvalidatedModuleConfig| {
                let fakes = Arc::clone(&factory_fakes);
                let module = config.module.clone();
                Box::pin(async move {
                    let fake = Arc::clone(
                        fakes
                            .lock()
                            .entry(module.clone())
                            .or_insert_with(|| FakePluginClient::new(&module)),
                    );
                    Ok(PluginSupervisor::for_client(
                        &module,
                        fake,
                        Duration::from_secs(1),
                    ))
                })
            });

        let config = EngineConfig {
            idle_debounce: Duration::from_millis(50),
            ..EngineConfig::default()
        };
        let engine = Engine::with_plugin_factory(
            Arc::clone(&controller) as Arc<dyn ControllerClient>,
            config,
            root.path().to_path_buf(),
            vec![root.path().to_path_buf()],
            factory,
        );
        Self {
            root,
            controller,
            engine,
            fakes,
        }
    }

    /// Create a module directory with a manifest, a deployable build output
    /// and a scripted plugin reporting `deps`.
    pub fn add_module(&self, name: &str, deps: &[&str]) {
        let dir = self.root.path().join(name);
        std::fs::create_dir_all(dir.join(".build")).unwrap();
        std::fs::write(
            dir.join(MODULE_MANIFEST),
            format!("module = \"{name}\"\nlanguage = \"go\"\n"),
        )
        .unwrap();
        std::fs::write(dir.join(".build/main"), format!("{name} binary")).unwrap();

        let fake = self.fake(name);
        *fake.dependencies.lock() = deps.iter().map(|d| (*d).to_owned()).collect();
        *fake.deploy_files.lock() = vec!["main".into()];
    }

    /// The scripted plugin for `name`, creating it if needed.
    pub fn fake(&self, name: &str) -> Arc<FakePluginClient> {
        Arc::clone(
            self.fakes
                .lock()
                .entry(name.to_owned())
                .or_insert_with(|| FakePluginClient::new(name)),
        )
    }
}

/// Collect events until `stop` matches one, panicking if the stream stalls.
pub async fn collect_until(
    rx: &mut broadcast::Receiver<EngineEvent>,
    mut stop: impl FnMut(&EngineEvent) -> bool,
) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Ok(event)) => {
                let done = stop(&event);
                events.push(event);
                if done {
                    return events;
                }
            }
            Ok(Err(err)) => panic!("event stream failed ({err}), saw: {events:?}"),
            Err(_) => panic!("timed out waiting for events, saw: {events:?}"),
        }
    }
}
