use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time allowed to write a WebSocket message.
pub const WS_WRITE_WAIT: Duration = Duration::from_secs(30);

/// Maximum message size in bytes (1 MB).
///
/// Status reports carry opaque attribute payloads (battery, storage,
/// installed apps); 1 MB is generous headroom for the largest fleets'
/// per-device reports without letting a broken agent exhaust hub memory.
pub const WS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Timeout for request/response operations (command ack, observer snapshot).
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Hard idle ceiling: a connection with zero traffic for this long is
/// closed regardless of heartbeat state, to bound resources held by
/// abandoned sockets.
pub const CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default hub heartbeat probe period.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

/// Agent heartbeat period while idle/locked.
pub const AGENT_IDLE_HEARTBEAT: Duration = Duration::from_secs(60);

/// Agent heartbeat period while in active foreground use.
pub const AGENT_ACTIVE_HEARTBEAT: Duration = Duration::from_secs(15);

/// How long the agent waits for the hub's first frame before treating the
/// confirmation handshake itself as failed. Distinct from ordinary
/// heartbeat silence: the socket opened but the hub never spoke.
pub const CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

/// Queued commands older than this are dropped and reported, never retried.
pub const COMMAND_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// Default attempt ceiling for queued commands.
pub const COMMAND_DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// WebSocket message type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Agent -> Hub
    #[serde(rename = "device_status")]
    DeviceStatus,
    #[serde(rename = "command_ack")]
    CommandAck,

    // Hub -> Agent
    #[serde(rename = "device_status_ack")]
    DeviceStatusAck,
    #[serde(rename = "command_delivery")]
    CommandDelivery,

    // Bidirectional heartbeat
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,

    // Observer path
    #[serde(rename = "observer_identify")]
    ObserverIdentify,
    #[serde(rename = "device_snapshot")]
    DeviceSnapshot,

    // Operator command path
    #[serde(rename = "command")]
    Command,
    #[serde(rename = "command_queued")]
    CommandQueued,

    // Secondary bulk channel
    #[serde(rename = "device_list")]
    DeviceList,

    // Registry change notifications (Hub -> observers)
    #[serde(rename = "device_connected")]
    DeviceConnected,
    #[serde(rename = "device_status_update")]
    DeviceStatusUpdate,
    #[serde(rename = "device_disconnected")]
    DeviceDisconnected,
    #[serde(rename = "command_failed")]
    CommandFailed,

    #[serde(rename = "error")]
    Error,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Close code sent to a connection superseded by a newer one claiming the
/// same device identifier.
pub const WS_CLOSE_SUPERSEDED: u16 = 4001;

/// Common WebSocket error codes.
pub const WS_ERR_CODE_BAD_REQUEST: i32 = 400;
pub const WS_ERR_CODE_NOT_FOUND: i32 = 404;
pub const WS_ERR_CODE_INTERNAL: i32 = 500;
pub const WS_ERR_CODE_NOT_IMPLEMENTED: i32 = 501;
