//! Server implementation
//!
//! HTTP listener, WebSocket lifecycle handling and monitoring endpoints.

mod acceptor;
mod api;
mod listener;

pub use acceptor::{CloseReason, ConnectionHandler};
pub use listener::{AppState, Server, ShutdownHandle};
