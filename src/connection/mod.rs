//! Connection management
//!
//! Per-connection state and the registry of live connections.

mod registry;
mod state;

pub use registry::{AdmissionSlot, ConnectionRegistry, RegistryConfig};
pub use state::{Connection, ConnectionId, ConnectionInfo, ConnectionPhase, Outbound};
