//! Message relay
//!
//! Broadcast fan-out and connection liveness.

mod dispatcher;
mod heartbeat;

pub use dispatcher::{DispatchReport, Dispatcher};
pub use heartbeat::{run_heartbeat, HeartbeatResult};
