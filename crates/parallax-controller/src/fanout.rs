//! Schema fan-out.
//!
//! A diff loop over the active deployments publishes Added / Changed /
//! Removed schema events to subscribers. Within one pass the `more` flag is
//! true on every event except the last, so a consumer can apply a whole
//! batch before reacting. Removal events carry the deployment key of the
//! last state we saw, taken from the in-memory snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use parallax_proto::controller::{SchemaChange, SchemaChangeType};
use parallax_proto::{Digest, DeploymentKey, Module};
use parallax_store::StateStore;

use crate::error::ControllerResult;

const TOPIC_CAPACITY: usize = 128;

#[derive(Clone)]
struct Known {
    deployment: DeploymentKey,
    digest: Digest,
    schema: Module,
}

pub struct SchemaFanout {
    store: Arc<dyn StateStore>,
    interval: Duration,
    topic: broadcast::Sender<SchemaChange>,
    known: Mutex<HashMap<String, Known>>,
}

impl SchemaFanout {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, interval: Duration) -> Self {
        let (topic, _) = broadcast::channel(TOPIC_CAPACITY);
        Self {
            store,
            interval,
            topic,
            known: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchemaChange> {
        self.topic.subscribe()
    }

    /// The current view as a batch of Added events, for subscribers that
    /// need to catch up before following the live topic.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SchemaChange> {
        let known = self.known.lock();
        let mut batch: Vec<_> = known
            .values()
            .map(|k| SchemaChange {
                change: SchemaChangeType::Added,
                module_name: k.schema.name.clone(),
                deployment: k.deployment,
                schema: Some(k.schema.clone()),
                more: true,
            })
            .collect();
        batch.sort_by(|a, b| a.module_name.cmp(&b.module_name));
        if let Some(last) = batch.last_mut() {
            last.more = false;
        }
        batch
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        warn!(error = %err, "schema fan-out pass failed");
                    }
                }
            }
        }
    }

    /// One diff pass. Returns the number of events published.
    pub async fn tick(&self) -> ControllerResult<usize> {
        let active = self.store.get_active_deployments().await?;

        let mut known = self.known.lock();
        let mut batch = Vec::new();
        let mut seen = HashMap::new();
        for deployment in active {
            let digest = deployment.schema.digest();
            let change = match known.get(&deployment.module) {
                None => Some(SchemaChangeType::Added),
                Some(prev) if prev.deployment != deployment.key || prev.digest != digest => {
                    Some(SchemaChangeType::Changed)
                }
                Some(_) => None,
            };
            if let Some(change) = change {
                batch.push(SchemaChange {
                    change,
                    module_name: deployment.module.clone(),
                    deployment: deployment.key,
                    schema: Some(deployment.schema.clone()),
                    more: true,
                });
            }
            seen.insert(
                deployment.module.clone(),
                Known {
                    deployment: deployment.key,
                    digest,
                    schema: deployment.schema,
                },
            );
        }
        for (module, prev) in known.iter() {
            if !seen.contains_key(module) {
                batch.push(SchemaChange {
                    change: SchemaChangeType::Removed,
                    module_name: module.clone(),
                    deployment: prev.deployment,
                    schema: None,
                    more: true,
                });
            }
        }
        *known = seen;
        drop(known);

        batch.sort_by(|a, b| a.module_name.cmp(&b.module_name));
        if let Some(last) = batch.last_mut() {
            last.more = false;
        }
        let count = batch.len();
        for event in batch {
            // Lagging subscribers miss events and resynchronise from the
            // snapshot; nothing to do here.
            let _ = self.topic.send(event);
        }
        Ok(count)
    }
}
