//! Replica reconciliation.
//!
//! Each tick compares every deployment's assigned replica count with its
//! target and moves one step towards the target: reserve-and-deploy one
//! runner when short, terminate one random assigned runner when over.
//! Failures are logged and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use parallax_proto::{Labels, RunnerState};
use parallax_store::{Reconciliation, StateStore};

use crate::clients::ClientPool;
use crate::error::{ControllerError, ControllerResult};
use crate::reservation::ReservationManager;

pub struct Reconciler {
    store: Arc<dyn StateStore>,
    pool: Arc<ClientPool>,
    reservations: ReservationManager,
    interval: Duration,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        pool: Arc<ClientPool>,
        reservations: ReservationManager,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            pool,
            reservations,
            interval,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    /// One reconciliation pass over every deployment that is off target.
    pub async fn tick(&self) {
        let rows = match self.store.deployments_needing_reconciliation().await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "failed to load reconciliation view");
                return;
            }
        };
        for row in rows {
            if let Err(err) = self.reconcile(&row).await {
                warn!(
                    deployment = %row.deployment,
                    module = %row.module,
                    error = %err,
                    "reconciliation failed, will retry",
                );
            }
        }
    }

    async fn reconcile(&self, row: &Reconciliation) -> ControllerResult<()> {
        if row.required_replicas > row.assigned_replicas {
            self.deploy_one(row).await
        } else {
            self.terminate_one(row).await
        }
    }

    async fn deploy_one(&self, row: &Reconciliation) -> ControllerResult<()> {
        let predicate = Labels::language(&row.language);
        let runner = self.reservations.reserve(&row.deployment, &predicate).await?;
        let client = self.pool.for_endpoint(&runner.endpoint);
        client.deploy(&row.deployment).await?;
        info!(
            deployment = %row.deployment,
            module = %row.module,
            runner = %runner.key,
            "deployment dispatched to runner",
        );
        Ok(())
    }

    async fn terminate_one(&self, row: &Reconciliation) -> ControllerResult<()> {
        let assigned: Vec<_> = self
            .store
            .runners_for_deployment(&row.deployment)
            .await?
            .into_iter()
            .filter(|runner| runner.state == RunnerState::Assigned)
            .collect();
        let mut runner = assigned
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| {
                ControllerError::NotFound(format!(
                    "assigned runner for deployment {}",
                    row.deployment,
                ))
            })?;
        let client = self.pool.for_endpoint(&runner.endpoint);
        let state = client.terminate(&row.deployment).await?;
        info!(
            deployment = %row.deployment,
            runner = %runner.key,
            state = %state,
            "terminated excess replica",
        );
        runner.state = state;
        if !matches!(state, RunnerState::Assigned | RunnerState::Reserved) {
            runner.deployment = None;
        }
        runner.last_seen = chrono::Utc::now();
        self.store.upsert_runner(runner).await?;
        Ok(())
    }
}
