//! Agent-side hub link.
//!
//! Connects out to the hub, announces the device with a `device_status`
//! report, and treats the hub's first frame back as confirmation that
//! the link is live. A bare TCP/WebSocket open is never enough. After
//! confirmation the client heartbeats at a cadence tied to device
//! activity and tears the link down after two silent heartbeat
//! intervals; the session loop then reconnects on a step-function
//! backoff schedule and never gives up until told to stop.

pub mod client;
pub mod heartbeat;
pub mod session;

pub use heartbeat::ActivityHandle;
pub use session::{AgentConfig, AgentSession, CommandCallback};

use fleetlink_protocol::messages::CommandDelivery;

/// Supplies the opaque attribute payload for status reports.
///
/// Implemented by the agent binary; the link layer never interprets the
/// attributes, it just ships them.
pub trait StatusSource: Send + Sync + 'static {
    fn attributes(&self) -> serde_json::Value;
}

/// Errors from the agent link.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    Closed,
}

/// A command pushed down from the hub, already acknowledged on the wire.
///
/// Acknowledgement means receipt, not completion; the hub may redeliver
/// if the ack is lost, so handlers should be idempotent.
pub type DeliveredCommand = CommandDelivery;
