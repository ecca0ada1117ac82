//! The language plugin build protocol.
//!
//! Plugins are subprocesses speaking length-prefixed JSON frames (see
//! [`crate::frame`]). Unary requests get exactly one response frame; a
//! `Build` request with `rebuild_automatically` set keeps its stream open and
//! the plugin pushes further [`BuildEvent`]s as it rebuilds on its own.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::schema::Module;

/// Resolved configuration of a single module, as shared with plugins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Module name, unique within a project.
    pub module: String,
    pub language: String,
    /// Absolute path of the module directory.
    pub dir: PathBuf,
    /// Directory build output is deployed from, relative to `dir`.
    pub deploy_dir: PathBuf,
    /// Glob patterns for files that should trigger rebuilds.
    #[serde(default)]
    pub watch: Vec<String>,
    /// Custom build command, when the language default is overridden.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
    /// Where generated schema files for dependencies are written, relative to
    /// `dir`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_schema_dir: Option<PathBuf>,
    /// Language-specific configuration, opaque to the engine.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub language_config: BTreeMap<String, serde_json::Value>,
}

impl ModuleConfig {
    /// Absolute path of the deploy directory.
    #[must_use]
    pub fn abs_deploy_dir(&self) -> PathBuf {
        self.dir.join(&self.deploy_dir)
    }
}

/// Defaults a plugin supplies for configuration keys the module manifest
/// leaves unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_dir: Option<PathBuf>,
    #[serde(default)]
    pub watch: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_schema_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub language_config: BTreeMap<String, serde_json::Value>,
}

/// Everything a plugin needs to run one build. The `id` is issued by the
/// supervisor and echoed back on every event the build produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildContext {
    pub id: String,
    pub config: ModuleConfig,
    /// Schemas of all modules visible to this build, dependencies included.
    pub schema: Vec<Module>,
    /// Names of the modules this module depends on.
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildErrorLevel {
    Info,
    Warn,
    Error,
}

/// A diagnostic produced by a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildError {
    pub level: BuildErrorLevel,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl BuildError {
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            level: BuildErrorLevel::Error,
            msg: msg.into(),
            file: None,
            line: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Events streamed by a plugin over an open build stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BuildEvent {
    LogMessage {
        level: LogLevel,
        message: String,
    },
    /// The plugin detected a source change and began rebuilding on its own.
    AutoRebuildStarted {
        context_id: String,
    },
    BuildSuccess(BuildOutcome),
    BuildFailure(BuildFailure),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutcome {
    pub context_id: String,
    pub is_automatic_rebuild: bool,
    pub module: Module,
    /// Files to deploy, relative to the module's deploy directory.
    #[serde(default)]
    pub deploy_files: Vec<String>,
    #[serde(default)]
    pub errors: Vec<BuildError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFailure {
    pub context_id: String,
    pub is_automatic_rebuild: bool,
    #[serde(default)]
    pub errors: Vec<BuildError>,
    /// The plugin believes its dependency view is stale; the engine should
    /// re-resolve dependencies and retry once.
    #[serde(default)]
    pub invalidate_dependencies: bool,
}

/// Request frames sent from the supervisor to a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum PluginRequest {
    Ping,
    ModuleConfigDefaults {
        dir: PathBuf,
    },
    GetDependencies {
        config: ModuleConfig,
    },
    GenerateStubs {
        dir: PathBuf,
        module: Module,
        config: ModuleConfig,
    },
    SyncStubReferences {
        config: ModuleConfig,
        stubs_root: PathBuf,
        modules: Vec<String>,
    },
    Build {
        project_root: PathBuf,
        stubs_root: PathBuf,
        rebuild_automatically: bool,
        context: BuildContext,
    },
    /// Sent instead of a fresh `Build` while a rebuild-automatically stream
    /// is open.
    BuildContextUpdated {
        context: BuildContext,
    },
}

/// Response frames sent from a plugin to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum PluginResponse {
    Pong,
    ModuleConfigDefaults { defaults: CustomDefaults },
    Dependencies { modules: Vec<String> },
    Ack,
    BuildEvent { event: BuildEvent },
    Error { error: WireError },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_event_tagging() {
        let event = BuildEvent::AutoRebuildStarted {
            context_id: "time-3".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "auto_rebuild_started");
        assert_eq!(json["context_id"], "time-3");
    }

    #[test]
    fn failure_defaults_do_not_invalidate() {
        let json = r#"{"context_id":"echo-1","is_automatic_rebuild":false}"#;
        let failure: BuildFailure = serde_json::from_str(json).unwrap();
        assert!(!failure.invalidate_dependencies);
        assert!(failure.errors.is_empty());
    }
}
