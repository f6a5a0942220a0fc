//! Application orchestrator. Wires the store, the hub core, and the two
//! listeners together and waits for shutdown.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use fleetlink_hub_server::{http, FleetHub, HubServer};
use fleetlink_store::JsonFileStore;

use crate::config::Config;

/// Runs the hub until shutdown is requested.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    // -- Device store --
    let store = Arc::new(JsonFileStore::open(config.store_path.clone().into())?);

    // -- Hub core --
    let hub = FleetHub::new(store, config.tuning());
    let seeded = hub.seed().await?;
    tracing::info!(devices = seeded, "registry seeded from store");

    // -- WebSocket server --
    let server = HubServer::new(config.server(), Arc::clone(&hub), cancel.clone());
    let server_run = Arc::clone(&server);
    tokio::spawn(async move {
        if let Err(e) = server_run.run().await {
            tracing::error!("server error: {e}");
        }
    });

    // -- HTTP polling fallback --
    let (bound_tx, bound_rx) = tokio::sync::oneshot::channel();
    let http_hub = Arc::clone(&hub);
    let http_cancel = cancel.clone();
    let http_bind = config.http_bind;
    tokio::spawn(async move {
        if let Err(e) = http::serve_status(http_hub, http_bind, http_cancel, bound_tx).await {
            tracing::error!("status endpoint error: {e}");
        }
    });
    if let Ok(addr) = bound_rx.await {
        tracing::info!("status endpoint ready on http://{addr}/status");
    }

    tracing::info!("hub ready");

    // -- Main loop: wait for shutdown --
    tokio::select! {
        _ = cancel.cancelled() => {
            tracing::info!("shutdown signal received");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
    }

    cancel.cancel();
    Ok(())
}
