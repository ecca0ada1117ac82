//! Cluster state for the Parallax controller.
//!
//! [`StateStore`] is the façade every scheduling component goes through:
//! runner registration and reservation, deployments and their artefacts,
//! routing views and change notifications. The shipped implementation is
//! [`MemoryStore`], which provides the same atomicity guarantees a
//! transactional backend would behind the same trait.

pub mod error;
pub mod memory;
pub mod notify;
pub mod store;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use notify::{Action, DeploymentChange, Notification};
pub use store::{IngressRouteSpec, Reservation, StateStore};
pub use types::{ControllerRow, Deployment, IngressRoute, Reconciliation, Route, Runner};
