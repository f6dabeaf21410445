//! Local HTTP surface
//!
//! Producers post events here; each body becomes one upstream text frame.

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::time::Duration;
use tracing::{debug, warn};

use crate::agent::{AgentHandle, ForwardError};

/// Largest event body accepted
pub const MAX_EVENT_BYTES: usize = 4 * 1024 * 1024;

/// Delay between acknowledging `/shutdown` and stopping
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// Build the agent router
pub fn router(handle: AgentHandle) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/event", post(event))
        .route("/shutdown", post(shutdown))
        .layer(DefaultBodyLimit::max(MAX_EVENT_BYTES))
        .with_state(handle)
}

async fn healthz() -> &'static str {
    "OK"
}

async fn event(State(handle): State<AgentHandle>, body: Bytes) -> Response {
    let text = match String::from_utf8(body.to_vec()) {
        Ok(text) => text,
        Err(_) => return (StatusCode::BAD_REQUEST, "event body must be UTF-8").into_response(),
    };

    let len = text.len();
    match handle.forward(text).await {
        Ok(()) => {
            debug!(len, "Event forwarded");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(ForwardError::NotConnected) => {
            (StatusCode::SERVICE_UNAVAILABLE, "upstream not connected").into_response()
        }
        Err(e @ ForwardError::Write(_)) => {
            warn!(error = %e, "Event not forwarded");
            (StatusCode::BAD_GATEWAY, "upstream write failed").into_response()
        }
    }
}

async fn shutdown(State(handle): State<AgentHandle>) -> (StatusCode, &'static str) {
    tokio::spawn(async move {
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        handle.stop();
    });
    (StatusCode::ACCEPTED, "stopping")
}
