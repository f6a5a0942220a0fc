use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CommandPriority, DeviceRecord};

// ---------------------------------------------------------------------------
// Agent -> Hub
// ---------------------------------------------------------------------------

/// Establishes or refreshes a device. The first `device_status` on a
/// connection binds that connection to the device identifier and confirms
/// the device online.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReport {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Opaque attribute payload (battery, storage, installed apps, ...).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub attributes: serde_json::Value,
    /// Only present in bulk reports from the secondary channel; live agents
    /// never set these, the hub stamps them on arrival.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Acknowledges delivery of a queued command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAck {
    pub queue_id: String,
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

/// Liveness probe. `timestamp` is the sender's epoch milliseconds and is
/// echoed back in the pong so the sender can compute the round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingPayload {
    pub timestamp: i64,
}

/// Heartbeat response. Echoes the ping's timestamp and adds the
/// responder's own clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    pub timestamp: i64,
    pub server_time: i64,
}

// ---------------------------------------------------------------------------
// Operator command path
// ---------------------------------------------------------------------------

/// Operator-issued command targeting one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub device_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: CommandPriority,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub max_attempts: u32,
}

/// Hub's response to a `command` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandQueuedResponse {
    pub queue_id: String,
    /// `true` if the target was unreachable and the command went to the
    /// offline queue; `false` if delivery was attempted immediately.
    pub queued: bool,
}

/// Command pushed from hub to agent. Delivery is at-least-once: an agent
/// may see the same `queue_id` more than once if an ack is lost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDelivery {
    pub queue_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Observer path
// ---------------------------------------------------------------------------

/// Full current device snapshot, sent in reply to `observer_identify` and
/// served by the HTTP polling fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub devices: Vec<DeviceRecord>,
}

/// Minimal device reference for `device_disconnected` notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRef {
    pub device_id: String,
}

/// Pushed to observers when a command exhausts its attempts or expires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandFailedEvent {
    pub queue_id: String,
    pub device_id: String,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Secondary bulk channel
// ---------------------------------------------------------------------------

/// Batch "all devices" report arriving from a secondary channel. A device
/// reported offline here while connection tracking shows it recently online
/// is deferred behind the grace period, not flipped immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceListReport {
    pub devices: Vec<DeviceRecord>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}
