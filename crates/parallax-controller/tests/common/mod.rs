//! Shared helpers for controller integration tests.

pub mod fixtures;

pub use fixtures::TestCluster;
