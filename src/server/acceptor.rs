//! Connection lifecycle handler
//!
//! Drives a single upgraded WebSocket from registration to release.

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn, Span};

use crate::config::Config;
use crate::connection::{AdmissionSlot, Connection, ConnectionRegistry, Outbound};
use crate::metrics::METRICS;
use crate::relay::{run_heartbeat, Dispatcher, HeartbeatResult};

/// Why a connection's read loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer sent a close frame
    ClosedByPeer,
    /// Stream ended without a close frame
    Disconnected,
    /// Transport or protocol error while reading
    ReceiveError,
    /// Peer sent a frame type the relay does not carry
    UnsupportedData,
    /// Closed locally (heartbeat timeout, eviction, write failure)
    Closed,
    /// Relay is shutting down
    Shutdown,
}

/// Handles a single WebSocket connection
pub struct ConnectionHandler {
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<Dispatcher>,
    config: Arc<Config>,
}

impl ConnectionHandler {
    /// Create a new connection handler
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        dispatcher: Arc<Dispatcher>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            config,
        }
    }

    /// Serve an upgraded socket until either side closes it.
    ///
    /// The connection is registered before its first frame is read and is
    /// always unregistered on the way out, whatever ended the session. The
    /// admission slot is released once the connection counts itself.
    #[instrument(skip_all, fields(conn_id, remote_addr = %remote_addr))]
    pub async fn handle(
        self,
        socket: WebSocket,
        remote_addr: SocketAddr,
        slot: AdmissionSlot,
    ) -> CloseReason {
        let (conn, outbox) = self.registry.open(remote_addr);
        Span::current().record("conn_id", conn.id.to_string());

        let (sink, mut stream) = socket.split();

        conn.set_open();
        self.registry.register(conn.clone());
        drop(slot);

        let writer = tokio::spawn(write_loop(
            conn.clone(),
            sink,
            outbox,
            self.registry.clone(),
            self.config.relay.close_timeout(),
        ));

        let heartbeat = self.config.heartbeat.enabled.then(|| {
            tokio::spawn(watch_liveness(
                conn.clone(),
                self.config.heartbeat.interval(),
                self.config.heartbeat.timeout(),
            ))
        });

        let reason = self.read_loop(&conn, &mut stream).await;

        // Cleanup
        conn.close();
        self.registry.unregister(conn.id);

        if let Err(e) = writer.await {
            warn!(error = %e, "Writer task failed");
        }
        if let Some(heartbeat) = heartbeat {
            let _ = heartbeat.await;
        }
        conn.set_closed();

        debug!(
            reason = ?reason,
            duration_secs = conn.duration().as_secs_f64(),
            "Connection released"
        );
        reason
    }

    /// Read frames and hand text to the dispatcher
    async fn read_loop(&self, conn: &Connection, stream: &mut SplitStream<WebSocket>) -> CloseReason {
        loop {
            let next = tokio::select! {
                biased;
                _ = conn.closed() => {
                    return if self.registry.is_shutting_down() {
                        CloseReason::Shutdown
                    } else {
                        CloseReason::Closed
                    };
                }
                next = stream.next() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    debug!(error = %e, "Receive error");
                    return CloseReason::ReceiveError;
                }
                None => return CloseReason::Disconnected,
            };

            conn.mark_alive();

            match message {
                Message::Text(text) => {
                    let len = text.as_str().len() as u64;
                    conn.record_rx(len);
                    METRICS.message_received(len);
                    self.dispatcher.dispatch(&text, conn.id);
                }
                Message::Binary(data) => {
                    debug!(len = data.len(), "Binary frame rejected");
                    conn.close_with(close_code::UNSUPPORTED, "binary frames are not relayed");
                    return CloseReason::UnsupportedData;
                }
                Message::Close(frame) => {
                    debug!(code = frame.as_ref().map(|f| f.code), "Close frame received");
                    return CloseReason::ClosedByPeer;
                }
                // Pings are answered by the protocol layer; pongs only prove liveness
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    }
}

/// Drain the outbound queue onto the socket, then send the close frame.
async fn write_loop(
    conn: Arc<Connection>,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbox: mpsc::Receiver<Outbound>,
    registry: Arc<ConnectionRegistry>,
    close_timeout: Duration,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = conn.closed() => break,
            frame = outbox.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let sent = tokio::select! {
            biased;
            _ = conn.closed() => break,
            sent = sink.send(frame.into_message()) => sent,
        };

        if let Err(e) = sent {
            debug!(conn_id = %conn.id, error = %e, "Socket write failed");
            METRICS.delivery_failed();
            conn.close();
            break;
        }
    }

    outbox.close();

    let frame = if registry.is_shutting_down() {
        CloseFrame {
            code: close_code::AWAY,
            reason: Utf8Bytes::from_static("server shutting down"),
        }
    } else {
        conn.take_close_frame().unwrap_or(CloseFrame {
            code: close_code::NORMAL,
            reason: Utf8Bytes::from_static(""),
        })
    };

    // The peer may already be gone; the handshake is best effort
    let _ = tokio::time::timeout(close_timeout, async {
        sink.send(Message::Close(Some(frame))).await?;
        sink.close().await
    })
    .await;
}

/// Close the connection if the heartbeat gives up on it
async fn watch_liveness(conn: Arc<Connection>, interval: Duration, timeout: Duration) {
    if run_heartbeat(conn.clone(), interval, timeout).await == HeartbeatResult::TimedOut {
        METRICS.heartbeat_timeout();
        warn!(
            conn_id = %conn.id,
            remote_addr = %conn.remote_addr,
            idle_secs = conn.idle_duration().as_secs_f64(),
            "Peer stopped responding, closing"
        );
        conn.close_with(close_code::AWAY, "heartbeat timeout");
    }
}
