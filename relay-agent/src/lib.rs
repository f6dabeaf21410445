//! Relay Agent Library
//!
//! Local forwarder that holds one WebSocket to a fan-out relay and relays
//! events posted to its HTTP surface.

pub mod agent;
pub mod client;
pub mod config;
pub mod http;

pub use agent::{Agent, AgentHandle, ForwardError};
pub use client::{is_running_at, send_event, Event, DEFAULT_ADDR};
pub use config::Config;

/// Agent version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
