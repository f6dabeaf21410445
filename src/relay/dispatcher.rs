//! Broadcast dispatcher
//!
//! Fans a single inbound message out to every other registered connection.

use axum::extract::ws::{close_code, Utf8Bytes};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::connection::{ConnectionId, ConnectionRegistry};
use crate::error::SendError;
use crate::metrics::METRICS;

/// Outcome of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Recipients whose queue accepted the message
    pub delivered: usize,
    /// Recipients already closing, pruned without a send attempt
    pub skipped: usize,
    /// Recipients whose send failed and were removed
    pub evicted: usize,
}

impl DispatchReport {
    /// Connections the dispatcher looked at, sender excluded
    pub fn considered(&self) -> usize {
        self.delivered + self.skipped + self.evicted
    }
}

/// Routes a sender's messages to all of its peers
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl Dispatcher {
    /// Create a dispatcher over a registry
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Send `message` to every registered connection except `sender`.
    ///
    /// Sends are non-blocking enqueues, so a call completes the fan-out
    /// before returning and never waits on a peer's socket. A recipient that
    /// is closing, or whose send fails, is closed and unregistered; the
    /// failure is never reported to the sender.
    pub fn dispatch(&self, message: &Utf8Bytes, sender: ConnectionId) -> DispatchReport {
        let mut report = DispatchReport::default();

        for peer in self.registry.snapshot() {
            if peer.id == sender {
                continue;
            }

            if peer.is_closing() {
                self.registry.unregister(peer.id);
                report.skipped += 1;
                continue;
            }

            match peer.try_send_text(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    debug!(
                        conn_id = %peer.id,
                        remote_addr = %peer.remote_addr,
                        reason = e.as_str(),
                        "Dropping peer after failed send"
                    );
                    METRICS.delivery_failed();
                    METRICS.eviction();
                    match e {
                        SendError::Backpressure => {
                            peer.close_with(close_code::AGAIN, "slow consumer");
                        }
                        SendError::Closed => {
                            peer.close();
                        }
                    }
                    self.registry.unregister(peer.id);
                    report.evicted += 1;
                }
            }
        }

        METRICS.message_relayed(report.delivered as u64, message.as_str().len() as u64);
        trace!(
            sender = %sender,
            delivered = report.delivered,
            skipped = report.skipped,
            evicted = report.evicted,
            "Message relayed"
        );

        report
    }
}
