//! The Parallax build engine: discovers modules, supervises their language
//! plugins, builds in dependency order, deploys to the controller and
//! rebuilds on change in dev mode.

pub mod config;
pub mod controller_client;
pub mod deploy;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod moduleconfig;
pub mod plugin;
pub mod plugin_client;
pub mod watch;

pub use config::EngineConfig;
pub use controller_client::{ControllerClient, FakeControllerClient, HttpControllerClient};
pub use engine::{Engine, ModuleMeta, PluginFactory};
pub use error::{EngineError, EngineResult};
pub use events::EngineEvent;
pub use moduleconfig::{UnvalidatedModuleConfig, MODULE_MANIFEST};
pub use plugin::{BuildInputs, BuildOutput, PluginSpawnSettings, PluginSupervisor};
pub use plugin_client::{FakePluginClient, PluginClient, WirePluginClient};
pub use watch::{WatchEvent, WatchTransaction, Watcher};
