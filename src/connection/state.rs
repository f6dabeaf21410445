//! Connection state

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SendError;

/// Unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Create from raw u64
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionPhase {
    /// Handshake accepted, not yet a broadcast target
    Connecting = 0,
    /// Registered and receiving broadcasts
    Open = 1,
    /// Close requested; tasks are winding down
    Closing = 2,
    /// Tasks finished and socket released
    Closed = 3,
}

impl ConnectionPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionPhase::Connecting,
            1 => ConnectionPhase::Open,
            2 => ConnectionPhase::Closing,
            _ => ConnectionPhase::Closed,
        }
    }
}

/// A frame queued for the connection's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Relayed text payload
    Text(Utf8Bytes),
    /// Keep-alive probe
    Ping(Bytes),
}

impl Outbound {
    pub fn into_message(self) -> Message {
        match self {
            Outbound::Text(text) => Message::Text(text),
            Outbound::Ping(payload) => Message::Ping(payload),
        }
    }
}

/// Per-connection state shared between the lifecycle handler, its writer
/// task, the heartbeat and the dispatcher.
///
/// Everything here is either atomic or behind a short `parking_lot` lock, so
/// the dispatcher can inspect and enqueue without awaiting.
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier
    pub id: ConnectionId,
    /// Peer address (diagnostic only)
    pub remote_addr: SocketAddr,
    /// Connection start time
    pub connected_at: Instant,
    phase: AtomicU8,
    outbox: mpsc::Sender<Outbound>,
    closed: CancellationToken,
    close_frame: Mutex<Option<CloseFrame>>,
    last_active: Mutex<Instant>,
    alive: AtomicBool,
    messages_rx: AtomicU64,
    messages_tx: AtomicU64,
    bytes_rx: AtomicU64,
    bytes_tx: AtomicU64,
}

impl Connection {
    /// Create connection state and the receiving half of its outbound queue.
    ///
    /// `closed` is normally a child of the registry's shutdown token.
    pub fn new(
        id: ConnectionId,
        remote_addr: SocketAddr,
        queue_capacity: usize,
        closed: CancellationToken,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (outbox, rx) = mpsc::channel(queue_capacity.max(1));
        let now = Instant::now();
        let connection = Self {
            id,
            remote_addr,
            connected_at: now,
            phase: AtomicU8::new(ConnectionPhase::Connecting as u8),
            outbox,
            closed,
            close_frame: Mutex::new(None),
            last_active: Mutex::new(now),
            alive: AtomicBool::new(true),
            messages_rx: AtomicU64::new(0),
            messages_tx: AtomicU64::new(0),
            bytes_rx: AtomicU64::new(0),
            bytes_tx: AtomicU64::new(0),
        };
        (connection, rx)
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> ConnectionPhase {
        ConnectionPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Move `Connecting -> Open`. No effect once closing has started.
    pub fn set_open(&self) -> bool {
        self.phase
            .compare_exchange(
                ConnectionPhase::Connecting as u8,
                ConnectionPhase::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Check if connection is open
    pub fn is_open(&self) -> bool {
        self.phase() == ConnectionPhase::Open
    }

    /// True once a close has been requested or completed
    pub fn is_closing(&self) -> bool {
        self.phase() >= ConnectionPhase::Closing
    }

    /// Request close with a normal close frame.
    ///
    /// Returns `true` for the call that actually initiated the close.
    pub fn close(&self) -> bool {
        self.close_with(close_code::NORMAL, "")
    }

    /// Request close, recording the close frame the writer should send.
    pub fn close_with(&self, code: u16, reason: &'static str) -> bool {
        let mut current = self.phase.load(Ordering::Acquire);
        loop {
            if current >= ConnectionPhase::Closing as u8 {
                return false;
            }
            match self.phase.compare_exchange_weak(
                current,
                ConnectionPhase::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        *self.close_frame.lock() = Some(CloseFrame {
            code,
            reason: Utf8Bytes::from_static(reason),
        });
        self.closed.cancel();
        true
    }

    /// Terminal transition, set once the lifecycle handler has released everything
    pub fn set_closed(&self) {
        self.phase
            .store(ConnectionPhase::Closed as u8, Ordering::Release);
        self.closed.cancel();
    }

    /// Resolves when a close has been requested (or the relay is shutting down)
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Whether the close signal has fired
    pub fn close_requested(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close frame recorded by `close_with`, if any
    pub fn take_close_frame(&self) -> Option<CloseFrame> {
        self.close_frame.lock().take()
    }

    /// Enqueue a text frame without waiting.
    pub fn try_send_text(&self, text: Utf8Bytes) -> Result<(), SendError> {
        if self.is_closing() {
            return Err(SendError::Closed);
        }
        let len = text.as_str().len() as u64;
        self.enqueue(Outbound::Text(text))?;
        self.messages_tx.fetch_add(1, Ordering::Relaxed);
        self.bytes_tx.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    /// Enqueue a keep-alive ping without waiting.
    pub fn try_send_ping(&self) -> Result<(), SendError> {
        if self.is_closing() {
            return Err(SendError::Closed);
        }
        self.enqueue(Outbound::Ping(Bytes::new()))
    }

    fn enqueue(&self, frame: Outbound) -> Result<(), SendError> {
        self.outbox.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Record an inbound text message
    pub fn record_rx(&self, bytes: u64) {
        self.messages_rx.fetch_add(1, Ordering::Relaxed);
        self.bytes_rx.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Note inbound activity of any kind (including pongs)
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
        *self.last_active.lock() = Instant::now();
    }

    /// Read and clear the liveness flag
    pub fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }

    /// Get connection duration
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Get idle duration
    pub fn idle_duration(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    pub fn messages_rx(&self) -> u64 {
        self.messages_rx.load(Ordering::Relaxed)
    }

    pub fn messages_tx(&self) -> u64 {
        self.messages_tx.load(Ordering::Relaxed)
    }

    pub fn bytes_rx(&self) -> u64 {
        self.bytes_rx.load(Ordering::Relaxed)
    }

    pub fn bytes_tx(&self) -> u64 {
        self.bytes_tx.load(Ordering::Relaxed)
    }

    /// Convert to serializable info
    pub fn to_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.to_string(),
            remote_addr: self.remote_addr.to_string(),
            phase: format!("{:?}", self.phase()),
            duration_secs: self.duration().as_secs_f64(),
            idle_secs: self.idle_duration().as_secs_f64(),
            messages_rx: self.messages_rx(),
            messages_tx: self.messages_tx(),
            bytes_rx: self.bytes_rx(),
            bytes_tx: self.bytes_tx(),
        }
    }
}

/// Serializable connection information for API responses
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Connection ID (hex string)
    pub id: String,
    /// Peer IP:port
    pub remote_addr: String,
    /// Connection phase
    pub phase: String,
    /// Duration in seconds
    pub duration_secs: f64,
    /// Idle time in seconds
    pub idle_secs: f64,
    /// Text messages received from this peer
    pub messages_rx: u64,
    /// Text messages queued to this peer
    pub messages_tx: u64,
    /// Bytes received
    pub bytes_rx: u64,
    /// Bytes queued
    pub bytes_tx: u64,
}
