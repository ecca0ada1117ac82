//! Shared wire types for the Parallax platform.
//!
//! Everything that crosses a process boundary lives here: entity keys,
//! artefact digests, runner labels, the module schema AST, the controller and
//! runner RPC message shapes, the plugin build protocol, and the error
//! taxonomy those surfaces report.

pub mod controller;
pub mod digest;
pub mod error;
pub mod frame;
pub mod key;
pub mod labels;
pub mod language;
pub mod runner;
pub mod schema;

pub use controller::{
    ArtefactChunk, CreateDeploymentRequest, DeploymentArtefact, PingResponse, SchemaChange,
    SchemaChangeType, StatusResponse,
};
pub use digest::Digest;
pub use error::{ErrorKind, WireError};
pub use key::{ControllerKey, DeploymentKey, RunnerKey};
pub use labels::Labels;
pub use language::{
    BuildContext, BuildError, BuildErrorLevel, BuildEvent, BuildFailure, BuildOutcome,
    CustomDefaults, ModuleConfig, PluginRequest, PluginResponse,
};
pub use runner::{RunnerHeartbeat, RunnerState, VerbRef};
pub use schema::{Module, Verb};
