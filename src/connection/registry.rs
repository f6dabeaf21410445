//! Connection registry
//!
//! The authoritative set of live connections. Mutated by the accept path
//! (`register`) and the disconnect path (`unregister`), read by the
//! dispatcher through `snapshot`.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::{Connection, ConnectionId, ConnectionInfo, Outbound};
use crate::metrics::METRICS;

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,
    /// Outbound queue capacity given to each new connection
    pub outbound_queue: usize,
}

/// Tracks all registered connections
pub struct ConnectionRegistry {
    /// Registered connections by ID
    connections: DashMap<ConnectionId, Arc<Connection>>,
    /// ID generator
    next_id: AtomicU64,
    /// Admitted upgrades not yet registered
    pending: AtomicUsize,
    /// Configuration
    config: RegistryConfig,
    /// Root of every connection's close signal
    shutdown: CancellationToken,
}

impl ConnectionRegistry {
    /// Create a new registry
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            pending: AtomicUsize::new(0),
            config,
            shutdown: CancellationToken::new(),
        })
    }

    /// Allocate a fresh connection identity
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Build state for a freshly accepted peer.
    ///
    /// The connection is not yet a broadcast target; call `register` once it
    /// is open.
    pub fn open(&self, remote_addr: SocketAddr) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (connection, outbox) = Connection::new(
            self.next_id(),
            remote_addr,
            self.config.outbound_queue,
            self.shutdown.child_token(),
        );
        (Arc::new(connection), outbox)
    }

    /// Register a connection as a broadcast target.
    ///
    /// Registering an identity that is already present leaves the existing
    /// entry in place.
    pub fn register(&self, connection: Arc<Connection>) {
        let id = connection.id;
        let remote_addr = connection.remote_addr;
        match self.connections.entry(id) {
            Entry::Occupied(_) => {
                debug!(conn_id = %id, "Connection already registered");
            }
            Entry::Vacant(slot) => {
                slot.insert(connection);
                METRICS.connection_opened();
                info!(conn_id = %id, %remote_addr, "Peer connected");
            }
        }
    }

    /// Unregister a connection. Removing an absent entry is a no-op.
    ///
    /// Returns whether an entry was removed.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        match self.connections.remove(&id) {
            Some((_, connection)) => {
                METRICS.connection_closed();
                info!(
                    conn_id = %id,
                    remote_addr = %connection.remote_addr,
                    duration_secs = connection.duration().as_secs_f64(),
                    messages_rx = connection.messages_rx(),
                    messages_tx = connection.messages_tx(),
                    "Peer disconnected"
                );
                true
            }
            None => false,
        }
    }

    /// Owned copy of the current membership.
    ///
    /// Shard locks are released before this returns, so callers can iterate
    /// (and unregister) freely.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Look up a single connection
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    /// Check whether an identity is registered
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Get current connection count
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Check if at capacity, counting admitted upgrades not yet registered
    pub fn is_full(&self) -> bool {
        self.is_full_with(self.pending.load(Ordering::Acquire))
    }

    fn is_full_with(&self, pending: usize) -> bool {
        self.config.max_connections != 0 && self.len() + pending >= self.config.max_connections
    }

    /// Claim a capacity slot for a connection that has not registered yet.
    ///
    /// Returns `None` at capacity. The slot is released when dropped; the
    /// holder drops it after `register`.
    pub fn try_reserve(self: &Arc<Self>) -> Option<AdmissionSlot> {
        let mut pending = self.pending.load(Ordering::Acquire);
        loop {
            if self.is_full_with(pending) {
                return None;
            }
            match self.pending.compare_exchange_weak(
                pending,
                pending + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(AdmissionSlot {
                        registry: self.clone(),
                    })
                }
                Err(current) => pending = current,
            }
        }
    }

    /// List all registered connections, oldest first
    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        let mut connections = self.snapshot();
        connections.sort_by_key(|c| c.id);
        connections.iter().map(|c| c.to_info()).collect()
    }

    /// Close every current and future connection
    pub fn shutdown(&self) {
        info!(connections = self.len(), "Closing all connections");
        self.shutdown.cancel();
    }

    /// Wait for registered connections to unregister, up to `timeout`.
    ///
    /// Returns the number still registered when it gave up.
    pub async fn drain(&self, timeout: Duration) -> usize {
        info!(connections = self.len(), "Starting connection drain");

        let start = tokio::time::Instant::now();
        while !self.is_empty() && start.elapsed() < timeout {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let remaining = self.len();
        if remaining > 0 {
            warn!(remaining, "Drain timed out with connections still registered");
        } else {
            info!("All connections drained");
        }
        remaining
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled by `shutdown`
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// Capacity held for one admitted upgrade until it registers
pub struct AdmissionSlot {
    registry: Arc<ConnectionRegistry>,
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.registry.pending.fetch_sub(1, Ordering::AcqRel);
    }
}
