//! HTTP API for connection monitoring
//!
//! JSON endpoints served next to the WebSocket route on the same listener.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Serialize;
use serde_json::json;

use super::listener::AppState;
use crate::connection::ConnectionInfo;
use crate::metrics::{MetricsSnapshot, METRICS};

/// Response for `/healthz`
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Response for `/connections`
#[derive(Debug, Serialize)]
pub struct ConnectionsResponse {
    pub count: usize,
    pub connections: Vec<ConnectionInfo>,
}

/// Response for `/stats`
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub version: &'static str,
    pub uptime_secs: u64,
    pub registered: usize,
    #[serde(flatten)]
    pub counters: MetricsSnapshot,
}

/// GET /healthz
pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// GET /connections
pub async fn connections(State(state): State<AppState>) -> Json<ConnectionsResponse> {
    let connections = state.registry.list_connections();
    Json(ConnectionsResponse {
        count: connections.len(),
        connections,
    })
}

/// GET /stats
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        version: crate::VERSION,
        uptime_secs: state.started_at.elapsed().as_secs(),
        registered: state.registry.len(),
        counters: METRICS.snapshot(),
    })
}

/// GET /
pub async fn index(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "endpoints": {
            state.config.server.ws_path.clone(): "WebSocket relay",
            "/healthz": "Liveness probe",
            "/connections": "List all registered connections",
            "/stats": "Relay statistics"
        }
    }))
}

/// Anything else
pub async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" })))
}
