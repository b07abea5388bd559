//! HTTP management API: mapping CRUD, server control and log browsing.

use crate::events::{EventLog, LogPage, LogQuery, LogStats};
use crate::mappings::{Mapping, MappingTable};
use crate::server::{DnsServer, ServerStatus};
use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::Json,
    routing::{get, post, put},
    Router,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub server: Arc<DnsServer>,
    pub mappings: Arc<MappingTable>,
    pub events: Arc<EventLog>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/mappings", get(list_mappings).post(create_mapping))
        .route(
            "/api/mappings/{domain}",
            get(get_mapping).delete(delete_mapping),
        )
        .route("/api/mappings/{domain}/enabled", put(set_mapping_enabled))
        .route("/api/server/status", get(server_status))
        .route("/api/server/start", post(start_server))
        .route("/api/server/stop", post(stop_server))
        .route("/api/server/restart", post(restart_server))
        .route("/api/logs", get(get_logs).delete(clear_logs))
        .route("/api/logs/stats", get(log_stats))
        .route("/api/logs/realtime", get(realtime_logs))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Management API listening on http://{}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct CreateMappingRequest {
    pub domain: String,
    pub ip_address: String,
}

#[derive(Debug, Deserialize)]
pub struct SetEnabledRequest {
    pub enabled: bool,
}

async fn list_mappings(State(state): State<AppState>) -> Json<Vec<Mapping>> {
    Json(state.mappings.list())
}

async fn create_mapping(
    State(state): State<AppState>,
    Json(req): Json<CreateMappingRequest>,
) -> Result<(StatusCode, Json<Mapping>), (StatusCode, String)> {
    if req.domain.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Domain is required".to_string()));
    }
    if req.ip_address.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "IP address is required".to_string()));
    }
    let mapping = state
        .mappings
        .upsert(&req.domain, &req.ip_address)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok((StatusCode::CREATED, Json(mapping)))
}

async fn get_mapping(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Result<Json<Mapping>, (StatusCode, String)> {
    state.mappings.get(&domain).map(Json).ok_or((
        StatusCode::NOT_FOUND,
        format!("Mapping for domain '{}' not found", domain),
    ))
}

async fn delete_mapping(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    if state.mappings.remove(&domain) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((
            StatusCode::NOT_FOUND,
            format!("Mapping for domain '{}' not found", domain),
        ))
    }
}

async fn set_mapping_enabled(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    Json(req): Json<SetEnabledRequest>,
) -> Result<Json<Mapping>, (StatusCode, String)> {
    if !state.mappings.set_enabled(&domain, req.enabled) {
        return Err((
            StatusCode::NOT_FOUND,
            format!("Mapping for domain '{}' not found", domain),
        ));
    }
    // set_enabled just succeeded, so the entry is present.
    state.mappings.get(&domain).map(Json).ok_or((
        StatusCode::INTERNAL_SERVER_ERROR,
        "Mapping vanished mid-update".to_string(),
    ))
}

async fn server_status(State(state): State<AppState>) -> Json<ServerStatus> {
    Json(state.server.status())
}

async fn start_server(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, String)> {
    state
        .server
        .start()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({ "message": "DNS server started successfully" })))
}

async fn stop_server(State(state): State<AppState>) -> Json<Value> {
    state.server.stop().await;
    Json(json!({ "message": "DNS server stopped successfully" }))
}

async fn restart_server(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, String)> {
    state.server.stop().await;
    state
        .server
        .start()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({ "message": "DNS server restarted successfully" })))
}

async fn get_logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Json<LogPage> {
    Json(state.events.query(&query))
}

async fn log_stats(State(state): State<AppState>) -> Json<LogStats> {
    Json(state.events.stats())
}

/// Streams a replay of the most recent entries as server-sent events, then
/// keeps the connection alive with periodic comments.
async fn realtime_logs(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut recent = state
        .events
        .query(&LogQuery {
            page_size: Some(20),
            ..Default::default()
        })
        .logs;
    // Replay in chronological order.
    recent.reverse();
    let stream = futures::stream::iter(recent.into_iter().map(|entry| {
        let data = serde_json::to_string(&entry).unwrap_or_default();
        Ok(Event::default().event("log").data(data))
    }));
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(10))
            .text("keepalive"),
    )
}

async fn clear_logs(State(state): State<AppState>) -> Json<Value> {
    state.events.clear();
    tracing::info!("Logs cleared via API");
    Json(json!({ "message": "Logs cleared successfully" }))
}
