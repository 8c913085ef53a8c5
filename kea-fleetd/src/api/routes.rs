use std::collections::BTreeMap;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use shared::protocol::API_PREFIX;
use shared::types::{App, Event, HaService, Subnet};
use crate::store::db::DaemonRate;
use crate::store_manager::StoreHandle;

const DEFAULT_EVENT_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub store: StoreHandle,
    pub hash_rx: watch::Receiver<String>,
}

#[derive(Deserialize)]
pub struct EventQuery {
    pub limit: Option<usize>,
}

/// Fleet-wide counters as decimal strings, since they can exceed 64 bits.
#[derive(Serialize)]
pub struct StatsResponse {
    pub global: BTreeMap<String, String>,
    pub rps: Vec<DaemonRate>,
}

pub fn router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/apps", get(get_apps))
        .route("/apps/:id", get(get_app))
        .route("/subnets", get(get_subnets))
        .route("/stats", get(get_stats))
        .route("/events", get(get_events))
        .route("/ha-services", get(get_ha_services))
        .route("/state/hash", get(get_hash));

    Router::new().nest(API_PREFIX, v1).with_state(state)
}

fn internal_error(what: &str, e: anyhow::Error) -> StatusCode {
    tracing::error!("Failed to query {}: {:#}", what, e);
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn get_apps(State(state): State<AppState>) -> Result<Json<Vec<App>>, StatusCode> {
    state
        .store
        .get_all_apps()
        .await
        .map(Json)
        .map_err(|e| internal_error("apps", e))
}

async fn get_app(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<App>, StatusCode> {
    state
        .store
        .get_app(id)
        .await
        .map_err(|e| internal_error("app", e))?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_subnets(State(state): State<AppState>) -> Result<Json<Vec<Subnet>>, StatusCode> {
    state
        .store
        .get_subnets()
        .await
        .map(Json)
        .map_err(|e| internal_error("subnets", e))
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, StatusCode> {
    let global = state
        .store
        .get_global_stats()
        .await
        .map_err(|e| internal_error("statistics", e))?
        .into_iter()
        .map(|(name, value)| (name, value.to_string()))
        .collect();
    let rps = state
        .store
        .get_daemon_rates()
        .await
        .map_err(|e| internal_error("daemon rates", e))?;
    Ok(Json(StatsResponse { global, rps }))
}

async fn get_events(
    State(state): State<AppState>,
    Query(params): Query<EventQuery>,
) -> Result<Json<Vec<Event>>, StatusCode> {
    state
        .store
        .get_events(params.limit.unwrap_or(DEFAULT_EVENT_LIMIT))
        .await
        .map(Json)
        .map_err(|e| internal_error("events", e))
}

async fn get_ha_services(State(state): State<AppState>) -> Result<Json<Vec<HaService>>, StatusCode> {
    state
        .store
        .get_ha_services()
        .await
        .map(Json)
        .map_err(|e| internal_error("HA services", e))
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.hash_rx.borrow().clone()
}
