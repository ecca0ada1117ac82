//! Parallax controller binary.
//!
//! Runs the scheduling plane: HTTP API, reconciler, schema fan-out and the
//! liveness maintenance loops.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use parallax_controller::{
    api, reaper, ClientPool, Controller, ControllerConfig, Reconciler, ReservationManager,
    SchemaFanout,
};
use parallax_store::{MemoryStore, StateStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("parallax_controller=info".parse()?),
        )
        .init();

    info!("Parallax controller starting");

    let config: ControllerConfig = Figment::new()
        .merge(Toml::file("controller.toml"))
        .merge(Env::prefixed("CONTROLLER_").split("_"))
        .extract()?;
    info!(listen_addr = %config.api.listen_addr, "Configuration loaded");

    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let pool = Arc::new(ClientPool::new());
    let controller = Arc::new(Controller::new(
        Arc::clone(&store),
        Arc::clone(&pool),
        config.clone(),
    ));
    info!(key = %controller.key(), endpoint = controller.endpoint(), "Controller initialised");

    let cancel = CancellationToken::new();

    let reservations = ReservationManager::new(
        Arc::clone(&store),
        Arc::clone(&pool),
        config.runners.reservation_timeout,
    );
    let reconciler = Reconciler::new(
        Arc::clone(&store),
        Arc::clone(&pool),
        reservations,
        config.scheduling.reconcile_interval,
    );
    {
        let cancel = cancel.clone();
        tokio::spawn(async move { reconciler.run(cancel).await });
    }

    let fanout = Arc::new(SchemaFanout::new(
        Arc::clone(&store),
        config.scheduling.fanout_interval,
    ));
    {
        let fanout = Arc::clone(&fanout);
        let cancel = cancel.clone();
        tokio::spawn(async move { fanout.run(cancel).await });
    }

    tokio::spawn(reaper::heartbeat_controller(
        Arc::clone(&store),
        controller.key(),
        controller.endpoint().to_owned(),
        config.scheduling.controller_timeout,
        cancel.clone(),
    ));
    tokio::spawn(reaper::reap_stale_runners(
        Arc::clone(&store),
        config.runners.heartbeat_timeout,
        cancel.clone(),
    ));
    tokio::spawn(reaper::reap_stale_controllers(
        Arc::clone(&store),
        config.scheduling.controller_timeout,
        cancel.clone(),
    ));
    tokio::spawn(reaper::expire_reservations(
        Arc::clone(&store),
        config.runners.reservation_timeout,
        cancel.clone(),
    ));

    let app = api::router(api::ApiState {
        controller: Arc::clone(&controller),
        fanout,
    });
    let listener = TcpListener::bind(&config.api.listen_addr).await?;
    info!(addr = %config.api.listen_addr, "Controller API listening");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
            shutdown.cancel();
        })
        .await?;
    cancel.cancel();

    Ok(())
}
