//! Periodic state polling and statistics pulling.

use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use shared::types::App;
use crate::config::AppEndpoint;
use crate::reconcile::Reconciler;
use crate::stats::puller::StatsPuller;
use crate::store_manager::StoreHandle;

/// Polls the configured apps and commits what changed.
pub struct AppMonitor {
    store: StoreHandle,
    reconciler: Reconciler,
    endpoints: Vec<AppEndpoint>,
    workers: usize,
}

impl AppMonitor {
    pub fn new(store: StoreHandle, reconciler: Reconciler, endpoints: Vec<AppEndpoint>, workers: usize) -> Self {
        Self {
            store,
            reconciler,
            endpoints,
            workers: workers.max(1),
        }
    }

    /// Reconciles one app. A never-seen app whose control agent doesn't
    /// answer is not stored; it is tried again next cycle.
    pub async fn poll_app(&self, endpoint: &AppEndpoint) -> Result<Option<App>> {
        let mut app = self
            .store
            .find_app(endpoint.address.clone(), endpoint.port)
            .await?
            .unwrap_or_else(|| App::new(endpoint.machine(), endpoint.access_point()));

        // Credentials and scheme always come from the configuration.
        app.machine.address = endpoint.machine.clone();
        app.machine.agent_port = endpoint.agent_port;
        app.access_points = vec![endpoint.access_point()];

        let outcome = self.reconciler.reconcile(&app).await;
        if app.id.is_none() && !outcome.reachable {
            tracing::warn!("Not adding {}: control agent is not reachable", app.label());
            return Ok(None);
        }

        let stored = self.store.commit_app(outcome.app, outcome.events).await?;
        Ok(Some(stored))
    }

    /// One cycle over every configured app, at most `workers` at a time.
    pub async fn poll_all(&self) {
        let results: Vec<(AppEndpoint, Result<Option<App>>)> = stream::iter(self.endpoints.clone())
            .map(|endpoint| async move {
                let result = self.poll_app(&endpoint).await;
                (endpoint, result)
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        for (endpoint, result) in results {
            if let Err(e) = result {
                tracing::error!("Failed to update kea@{}:{}: {:#}", endpoint.address, endpoint.port, e);
            }
        }
    }
}

pub async fn run_state_loop(monitor: Arc<AppMonitor>, period: Duration, cancel: CancellationToken) -> Result<()> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                tokio::select! {
                    _ = monitor.poll_all() => {}
                    _ = cancel.cancelled() => break,
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("State monitor shutting down");
                break;
            }
        }
    }
    Ok(())
}

pub async fn run_stats_loop(puller: Arc<StatsPuller>, period: Duration, cancel: CancellationToken) -> Result<()> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                tokio::select! {
                    result = puller.pull_stats() => {
                        if let Err(e) = result {
                            tracing::error!("{}", e);
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Statistics puller shutting down");
                break;
            }
        }
    }
    Ok(())
}
