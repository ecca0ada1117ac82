//! Engine event types.
//!
//! Raw events come from build, deploy and watch activity; the engine folds
//! them into the public stream, bracketing bursts of activity with
//! `EngineStarted` and a debounced `EngineEnded`.

use std::collections::HashMap;

/// Events published to engine subscribers (the CLI, mostly).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The engine went from idle to busy.
    EngineStarted,
    /// The engine has been quiet for the debounce period. Carries the most
    /// recent error per module, empty when everything is healthy.
    EngineEnded {
        module_errors: HashMap<String, String>,
    },
    ModuleAdded {
        module: String,
    },
    ModuleRemoved {
        module: String,
    },
    ModuleBuildWaiting {
        module: String,
    },
    ModuleBuildStarted {
        module: String,
        is_auto_rebuild: bool,
    },
    ModuleBuildSuccess {
        module: String,
        is_auto_rebuild: bool,
    },
    ModuleBuildFailed {
        module: String,
        is_auto_rebuild: bool,
        error: String,
    },
    ModuleDeployStarted {
        module: String,
    },
    ModuleDeploySuccess {
        module: String,
    },
    ModuleDeployFailed {
        module: String,
        error: String,
    },
}

/// Events emitted by engine internals, before idle tracking is applied.
#[derive(Debug, Clone)]
pub(crate) enum RawEngineEvent {
    ModuleAdded {
        module: String,
    },
    ModuleRemoved {
        module: String,
    },
    ModuleBuildWaiting {
        module: String,
    },
    ModuleBuildStarted {
        module: String,
        is_auto_rebuild: bool,
    },
    ModuleBuildSuccess {
        module: String,
        is_auto_rebuild: bool,
    },
    ModuleBuildFailed {
        module: String,
        is_auto_rebuild: bool,
        error: String,
    },
    ModuleDeployStarted {
        module: String,
    },
    ModuleDeploySuccess {
        module: String,
    },
    ModuleDeployFailed {
        module: String,
        error: String,
    },
}
