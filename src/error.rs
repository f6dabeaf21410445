//! Per-recipient delivery outcomes

use thiserror::Error;

/// Why a frame could not be handed to a connection's writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The connection is closing or its writer has already stopped
    #[error("connection closed")]
    Closed,
    /// The outbound queue is full; the peer is not draining its socket
    #[error("outbound queue full")]
    Backpressure,
}

impl SendError {
    /// Short label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            SendError::Closed => "closed",
            SendError::Backpressure => "backpressure",
        }
    }
}
