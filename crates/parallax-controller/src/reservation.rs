//! Runner reservation.
//!
//! Claiming a runner is a two-step handshake: take the claim in the store
//! (instantly visible to competing reservers), then confirm with the runner
//! itself over its Reserve RPC. Only a confirmed claim is committed; any
//! failure rolls the runner back to the idle pool. Reservations that commit
//! but never progress to ASSIGNED are returned to the pool by the expiry
//! sweep.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use parallax_proto::{DeploymentKey, Labels};
use parallax_store::{Runner, StateStore};

use crate::clients::ClientPool;
use crate::error::{ControllerError, ControllerResult};

pub struct ReservationManager {
    store: Arc<dyn StateStore>,
    pool: Arc<ClientPool>,
    timeout: Duration,
}

impl ReservationManager {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, pool: Arc<ClientPool>, timeout: Duration) -> Self {
        Self {
            store,
            pool,
            timeout,
        }
    }

    /// Reserve an idle runner matching `predicate` for `deployment` and
    /// confirm the reservation with the runner.
    pub async fn reserve(
        &self,
        deployment: &DeploymentKey,
        predicate: &Labels,
    ) -> ControllerResult<Runner> {
        let mut reservation = self
            .store
            .reserve_runner(deployment, self.timeout, predicate)
            .await?;
        let runner = reservation.runner().clone();
        debug!(runner = %runner.key, %deployment, "claimed runner, confirming");

        let client = self.pool.for_endpoint(&runner.endpoint);
        let confirmed = tokio::time::timeout(self.timeout, client.reserve(deployment)).await;
        match confirmed {
            Ok(Ok(())) => {
                reservation.commit().await?;
                Ok(runner)
            }
            Ok(Err(err)) => {
                warn!(runner = %runner.key, %deployment, error = %err, "runner rejected reservation");
                reservation.rollback().await?;
                Err(err)
            }
            Err(_) => {
                warn!(runner = %runner.key, %deployment, "reservation confirmation timed out");
                reservation.rollback().await?;
                Err(ControllerError::DeadlineExceeded(format!(
                    "reserving runner {} for {deployment}",
                    runner.key,
                )))
            }
        }
    }
}
