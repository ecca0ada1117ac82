//! Change notifications published by the store.
//!
//! The store emits low-level `(table, action, old, new)` records; consumers
//! translate those into domain events. Deletions carry only the old row, so
//! translation never goes back to the store for a row that no longer exists.

use serde::{Deserialize, Serialize};

use parallax_proto::DeploymentKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Insert,
    Update,
    Delete,
}

/// Minimal row image carried on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentImage {
    pub key: DeploymentKey,
    pub module: String,
    pub min_replicas: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub table: &'static str,
    pub action: Action,
    /// Previous row image; always present for updates and deletes.
    pub old: Option<DeploymentImage>,
    /// New row image; absent for deletes.
    pub new: Option<DeploymentImage>,
}

/// A deployment change as seen by scheduling components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentChange {
    Added(DeploymentKey),
    Changed(DeploymentKey),
    Removed(DeploymentKey),
}

impl DeploymentChange {
    /// Translate a raw store notification. Returns `None` for malformed
    /// records rather than guessing.
    #[must_use]
    pub fn from_notification(notification: &Notification) -> Option<Self> {
        match notification.action {
            Action::Insert => Some(Self::Added(notification.new.as_ref()?.key)),
            Action::Update => Some(Self::Changed(notification.new.as_ref()?.key)),
            Action::Delete => Some(Self::Removed(notification.old.as_ref()?.key)),
        }
    }

    #[must_use]
    pub const fn key(&self) -> DeploymentKey {
        match self {
            Self::Added(key) | Self::Changed(key) | Self::Removed(key) => *key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(key: DeploymentKey) -> DeploymentImage {
        DeploymentImage {
            key,
            module: "time".into(),
            min_replicas: 1,
        }
    }

    #[test]
    fn delete_translates_from_old_row_only() {
        let key = DeploymentKey::generate();
        let notification = Notification {
            table: "deployments",
            action: Action::Delete,
            old: Some(image(key)),
            new: None,
        };
        assert_eq!(
            DeploymentChange::from_notification(&notification),
            Some(DeploymentChange::Removed(key)),
        );
    }

    #[test]
    fn malformed_records_are_dropped() {
        let notification = Notification {
            table: "deployments",
            action: Action::Insert,
            old: None,
            new: None,
        };
        assert_eq!(DeploymentChange::from_notification(&notification), None);
    }
}
