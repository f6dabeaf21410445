//! Fanout Relay - WebSocket broadcast relay
//!
//! Every text frame received from one connected peer is rebroadcast to all
//! other currently connected peers. The relay keeps no history and does not
//! interpret payloads.

pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod relay;
pub mod server;
pub mod util;

pub use config::Config;
pub use error::SendError;
pub use server::{Server, ShutdownHandle};

/// Server version for display
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
