mod api;
mod config;
mod events;
mod ha;
mod kea;
mod monitor;
mod reconcile;
mod stats;
mod store;
mod store_manager;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::config::Config;
use crate::kea::ca_client::CaClient;
use crate::kea::commands::CommandForwarder;
use crate::monitor::AppMonitor;
use crate::reconcile::Reconciler;
use crate::stats::puller::StatsPuller;
use crate::store::db::Store;
use crate::store_manager::StoreHandle;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("kea_fleetd=info"))
        )
        .init();

    tracing::info!("Starting kea-fleetd");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/kea-fleet/fleetd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {} ({} apps)", config_path, config.apps.len());

    let store = Store::open(&config.store.db_path)?;
    tracing::info!("Opened database at {:?}", config.store.db_path);

    let initial_hash = crate::store::hash::fleet_hash(&store.get_all_apps()?);
    tracing::info!("Initial fleet hash: {}", initial_hash);

    let (hash_tx, hash_rx) = watch::channel(initial_hash);
    let (events_tx, event_center) = events::channel();
    let store_handle = StoreHandle::spawn(store, hash_tx, events_tx);

    let cancel = CancellationToken::new();

    let events_cancel = cancel.clone();
    let events_handle = tokio::spawn(async move {
        if let Err(e) = event_center.run(events_cancel).await {
            tracing::error!("Event center error: {}", e);
        }
    });

    let forwarder: Arc<dyn CommandForwarder> = Arc::new(CaClient::new()?);
    let timeout = config.monitor.request_timeout();

    let app_monitor = Arc::new(AppMonitor::new(
        store_handle.clone(),
        Reconciler::new(forwarder.clone(), timeout),
        config.apps.clone(),
        config.monitor.workers,
    ));
    let state_cancel = cancel.clone();
    let state_period = Duration::from_secs(config.monitor.state_interval_secs);
    let state_handle = tokio::spawn(async move {
        if let Err(e) = monitor::run_state_loop(app_monitor, state_period, state_cancel).await {
            tracing::error!("State monitor error: {}", e);
        }
    });

    let puller = Arc::new(StatsPuller::new(store_handle.clone(), forwarder, timeout).await?);
    let stats_cancel = cancel.clone();
    let stats_period = Duration::from_secs(config.monitor.stats_interval_secs);
    let stats_handle = tokio::spawn(async move {
        if let Err(e) = monitor::run_stats_loop(puller, stats_period, stats_cancel).await {
            tracing::error!("Statistics puller error: {}", e);
        }
    });

    let app_state = api::routes::AppState {
        store: store_handle.clone(),
        hash_rx,
    };
    let app = api::routes::router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();

    let _ = tokio::join!(state_handle, stats_handle, server_handle);

    if let Err(e) = store_handle.shutdown().await {
        tracing::error!("Failed to shutdown store: {}", e);
    }

    let _ = events_handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
