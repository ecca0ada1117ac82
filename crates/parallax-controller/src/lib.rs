//! The Parallax controller.
//!
//! Keeps deployed modules reconciled against their replica targets across a
//! fleet of runners: artefact storage and streaming, runner reservation and
//! deployment, liveness reaping, schema fan-out and the HTTP API the engine
//! and runners talk to.

pub mod api;
pub mod artefact;
pub mod clients;
pub mod config;
pub mod error;
pub mod fanout;
pub mod reaper;
pub mod reconciler;
pub mod reservation;
pub mod service;

pub use clients::{ClientPool, HttpRunnerClient, MockRunnerClient, RunnerClient};
pub use config::ControllerConfig;
pub use error::{ControllerError, ControllerResult};
pub use fanout::SchemaFanout;
pub use reconciler::Reconciler;
pub use reservation::ReservationManager;
pub use service::Controller;
