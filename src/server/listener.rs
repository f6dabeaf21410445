//! HTTP/WebSocket listener
//!
//! Accepts upgrade requests, runs admission checks and hands each upgraded
//! socket to a `ConnectionHandler`.

use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::acceptor::ConnectionHandler;
use super::api;
use crate::config::Config;
use crate::connection::{ConnectionRegistry, RegistryConfig};
use crate::metrics::METRICS;
use crate::relay::Dispatcher;

/// Shared state accessible from axum handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub config: Arc<Config>,
    pub started_at: Instant,
}

/// WebSocket fan-out relay server
pub struct Server {
    /// Bound TCP listener
    listener: tokio::net::TcpListener,
    /// Server configuration
    config: Arc<Config>,
    /// Connection registry
    registry: Arc<ConnectionRegistry>,
    /// Broadcast dispatcher
    dispatcher: Arc<Dispatcher>,
    started_at: Instant,
}

impl Server {
    /// Create a new server instance and bind its listener
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let registry = ConnectionRegistry::new(RegistryConfig {
            max_connections: config.server.max_connections,
            outbound_queue: config.relay.outbound_queue,
        });
        let dispatcher = Arc::new(Dispatcher::new(registry.clone()));

        let std_listener =
            crate::util::create_tcp_listener(config.server.bind_addr, config.server.backlog)?;
        let listener = tokio::net::TcpListener::from_std(std_listener)
            .context("Failed to register listener with the runtime")?;

        info!(
            max_connections = config.server.max_connections,
            outbound_queue = config.relay.outbound_queue,
            heartbeat = config.heartbeat.enabled,
            "Relay initialized"
        );

        Ok(Self {
            listener,
            config,
            registry,
            dispatcher,
            started_at: Instant::now(),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Connection registry
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Handle that can stop the server from another task
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            registry: self.registry.clone(),
        }
    }

    /// Build the axum router with all routes
    pub fn router(&self) -> Router {
        let state = AppState {
            registry: self.registry.clone(),
            dispatcher: self.dispatcher.clone(),
            config: self.config.clone(),
            started_at: self.started_at,
        };

        Router::new()
            .route(&self.config.server.ws_path, get(ws_handler))
            .route("/healthz", get(api::healthz))
            .route("/connections", get(api::connections))
            .route("/stats", get(api::stats))
            .route("/", get(api::index))
            .fallback(api::not_found)
            .with_state(state)
    }

    /// Serve until `ShutdownHandle::shutdown` is called.
    ///
    /// Shutdown stops accepting, closes every registered connection and waits
    /// for their handlers to finish.
    pub async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        info!(
            bind_addr = %addr,
            ws_path = %self.config.server.ws_path,
            "Server accepting connections"
        );

        let app = self.router();
        let shutdown = self.registry.shutdown_token();

        axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("Server error")?;

        self.registry.drain(self.config.relay.drain_timeout()).await;
        info!("Server shutdown complete");
        Ok(())
    }
}

/// Stops a running `Server`
#[derive(Clone)]
pub struct ShutdownHandle {
    registry: Arc<ConnectionRegistry>,
}

impl ShutdownHandle {
    /// Initiate graceful shutdown
    pub fn shutdown(&self) {
        info!("Initiating graceful shutdown");
        self.registry.shutdown();
    }
}

/// GET on the WebSocket route
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if !state.config.server.origin_allowed(origin) {
        METRICS.connection_rejected();
        warn!(%remote_addr, origin = origin.unwrap_or("-"), "Upgrade rejected: origin not allowed");
        return StatusCode::FORBIDDEN.into_response();
    }

    if state.registry.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let Some(slot) = state.registry.try_reserve() else {
        METRICS.connection_rejected();
        warn!(%remote_addr, "Upgrade rejected: at capacity");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let handler = ConnectionHandler::new(
        state.registry.clone(),
        state.dispatcher.clone(),
        state.config.clone(),
    );

    ws.on_failed_upgrade(move |e| {
        METRICS.connection_failed();
        debug!(%remote_addr, error = %e, "WebSocket upgrade failed");
    })
    .on_upgrade(move |socket| async move {
        handler.handle(socket, remote_addr, slot).await;
    })
}
