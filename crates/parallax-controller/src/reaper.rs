//! Liveness maintenance loops.
//!
//! The controller heartbeats its own row, reaps runners and controllers that
//! stop heartbeating, and returns expired reservations to the idle pool.
//! Heartbeat-driven loops tick at a quarter of the timeout they enforce.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use parallax_proto::ControllerKey;
use parallax_store::StateStore;

/// Keep this controller's row fresh.
pub async fn heartbeat_controller(
    store: Arc<dyn StateStore>,
    key: ControllerKey,
    endpoint: String,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(timeout / 4);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = store.upsert_controller(&key, &endpoint).await {
                    warn!(error = %err, "controller heartbeat failed");
                }
            }
        }
    }
}

/// Remove runners that have missed their heartbeat window.
pub async fn reap_stale_runners(
    store: Arc<dyn StateStore>,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(timeout / 4);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match store.kill_stale_runners(timeout).await {
                    Ok(0) => {}
                    Ok(count) => info!(count, "reaped stale runners"),
                    Err(err) => warn!(error = %err, "failed to reap stale runners"),
                }
            }
        }
    }
}

/// Remove controllers that have missed their heartbeat window.
pub async fn reap_stale_controllers(
    store: Arc<dyn StateStore>,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(timeout / 4);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match store.kill_stale_controllers(timeout).await {
                    Ok(0) => {}
                    Ok(count) => info!(count, "reaped stale controllers"),
                    Err(err) => warn!(error = %err, "failed to reap stale controllers"),
                }
            }
        }
    }
}

/// Return runners whose reservation outlived its timeout to the idle pool.
pub async fn expire_reservations(
    store: Arc<dyn StateStore>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match store.expire_runner_reservations().await {
                    Ok(0) => {}
                    Ok(count) => info!(count, "expired runner reservations"),
                    Err(err) => warn!(error = %err, "failed to expire reservations"),
                }
            }
        }
    }
}
