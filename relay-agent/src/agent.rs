//! Upstream relay connection
//!
//! Holds the single WebSocket to the relay and the loops that keep it alive.

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message, Utf8Bytes};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, UpstreamConfig};
use crate::http;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Why an event could not be forwarded
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The upstream connection is gone
    #[error("upstream not connected")]
    NotConnected,
    /// Writing the frame failed
    #[error("upstream write failed: {0}")]
    Write(#[from] tungstenite::Error),
}

/// Shared handle to a running agent
#[derive(Clone)]
pub struct AgentHandle {
    upstream: Arc<Mutex<Option<WsSink>>>,
    stopped: CancellationToken,
}

impl AgentHandle {
    fn new(sink: Option<WsSink>) -> Self {
        Self {
            upstream: Arc::new(Mutex::new(sink)),
            stopped: CancellationToken::new(),
        }
    }

    /// Handle with no upstream, as if the relay had gone away
    #[cfg(test)]
    pub(crate) fn disconnected() -> Self {
        Self::new(None)
    }

    /// Send one text frame upstream
    pub async fn forward(&self, text: String) -> Result<(), ForwardError> {
        let mut upstream = self.upstream.lock().await;
        let sink = upstream.as_mut().ok_or(ForwardError::NotConnected)?;
        sink.send(Message::text(text)).await?;
        Ok(())
    }

    /// Request the agent to stop. Safe to call more than once.
    pub fn stop(&self) {
        if !self.stopped.is_cancelled() {
            info!("Agent stopping");
        }
        self.stopped.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Resolves once `stop` has been called
    pub async fn stopped(&self) {
        self.stopped.cancelled().await
    }

    async fn send(&self, message: Message) -> Result<(), ForwardError> {
        let mut upstream = self.upstream.lock().await;
        let sink = upstream.as_mut().ok_or(ForwardError::NotConnected)?;
        sink.send(message).await?;
        Ok(())
    }

    /// Drop the upstream without a close handshake
    async fn detach(&self) {
        self.upstream.lock().await.take();
    }

    /// Send a normal close frame and release the upstream
    async fn close_upstream(&self) {
        let Some(mut sink) = self.upstream.lock().await.take() else {
            return;
        };
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: Utf8Bytes::from_static("bye"),
        };
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            debug!(error = %e, "Close frame not sent");
        }
        let _ = sink.close().await;
    }
}

/// Local forwarder bound to its HTTP address and connected upstream
pub struct Agent {
    handle: AgentHandle,
    listener: TcpListener,
    pid_file: Option<PathBuf>,
}

impl Agent {
    /// Connect to the relay, bind the local listener and write the PID file
    pub async fn start(config: &Config) -> Result<Self> {
        let ws = dial(&config.upstream).await?;
        let (sink, stream) = ws.split();
        let handle = AgentHandle::new(Some(sink));

        let listener = match TcpListener::bind(config.agent.bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                handle.close_upstream().await;
                return Err(e).with_context(|| format!("Failed to bind {}", config.agent.bind_addr));
            }
        };

        let pid_file = config
            .agent
            .pid_file
            .as_deref()
            .and_then(|path| match write_pid_file(path) {
                Ok(()) => Some(path.to_path_buf()),
                Err(e) => {
                    warn!(path = ?path, error = %e, "Failed to write PID file");
                    None
                }
            });

        tokio::spawn(ping_loop(handle.clone(), config.upstream.ping_interval()));
        tokio::spawn(read_loop(
            stream,
            handle.clone(),
            config.upstream.read_timeout(),
        ));

        Ok(Self {
            handle,
            listener,
            pid_file,
        })
    }

    /// Address of the local HTTP surface
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> AgentHandle {
        self.handle.clone()
    }

    /// Serve the local HTTP surface until stopped, then release everything
    pub async fn run(self) -> Result<()> {
        info!(bind_addr = %self.local_addr()?, "Agent accepting events");

        let shutdown = self.handle.stopped.clone();
        let result = axum::serve(self.listener, http::router(self.handle.clone()))
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .context("Agent HTTP server error");

        self.handle.stop();
        self.handle.close_upstream().await;
        if let Some(path) = &self.pid_file {
            remove_pid_file(path);
        }

        info!("Agent stopped");
        result
    }
}

/// Connect to the relay, retrying up to `connect_attempts` times
pub async fn dial(config: &UpstreamConfig) -> Result<WsStream> {
    let mut last_error = None;

    for attempt in 1..=config.connect_attempts {
        match dial_once(config).await {
            Ok(ws) => {
                info!(endpoint = %config.ws_endpoint, attempt, "Connected to relay");
                return Ok(ws);
            }
            Err(e) => {
                warn!(endpoint = %config.ws_endpoint, attempt, error = %e, "Relay connection attempt failed");
                last_error = Some(e);
            }
        }

        if attempt < config.connect_attempts {
            tokio::time::sleep(config.retry_delay()).await;
        }
    }

    Err(last_error
        .unwrap_or_else(|| anyhow!("no connection attempts configured"))
        .context(format!(
            "Failed to connect to {} after {} attempts",
            config.ws_endpoint, config.connect_attempts
        )))
}

async fn dial_once(config: &UpstreamConfig) -> Result<WsStream> {
    let mut request = config
        .ws_endpoint
        .as_str()
        .into_client_request()
        .context("Invalid upstream endpoint")?;

    if let Some(api_key) = &config.api_key {
        let value = HeaderValue::from_str(api_key).context("api_key is not a valid header value")?;
        request.headers_mut().insert("X-API-Key", value);
    }

    let (ws, _response) = tokio::time::timeout(config.handshake_timeout(), connect_async(request))
        .await
        .context("Handshake timed out")?
        .context("WebSocket handshake failed")?;

    Ok(ws)
}

async fn ping_loop(handle: AgentHandle, interval: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = handle.stopped() => return,
            _ = ticker.tick() => {
                if let Err(e) = handle.send(Message::Ping(Bytes::new())).await {
                    warn!(error = %e, "Upstream ping failed");
                    handle.stop();
                    return;
                }
            }
        }
    }
}

/// Discard inbound frames; stop the agent once the upstream is gone or silent
async fn read_loop(mut stream: SplitStream<WsStream>, handle: AgentHandle, read_timeout: Duration) {
    loop {
        let next = tokio::select! {
            _ = handle.stopped() => return,
            next = tokio::time::timeout(read_timeout, stream.next()) => next,
        };

        match next {
            Err(_) => {
                warn!(timeout_secs = read_timeout.as_secs(), "Upstream silent, giving up");
                break;
            }
            Ok(None) => {
                info!("Upstream stream ended");
                break;
            }
            Ok(Some(Err(e))) => {
                warn!(error = %e, "Upstream read failed");
                break;
            }
            Ok(Some(Ok(Message::Close(frame)))) => {
                info!(code = ?frame.as_ref().map(|f| f.code), "Upstream closed");
                break;
            }
            Ok(Some(Ok(_))) => {}
        }
    }

    handle.detach().await;
    handle.stop();
}

fn write_pid_file(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, std::process::id().to_string())
}

fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        debug!(path = ?path, error = %e, "PID file not removed");
    }
}
