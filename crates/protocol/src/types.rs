use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Online/offline judgment for a device, as decided by the reconciler.
///
/// Distinct from raw connection state: a transport can be open without the
/// device being considered online (confirmation-before-liveness), and a
/// device can briefly stay online after its transport drops (grace period).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessStatus {
    Online,
    Offline,
}

/// Priority band for queued commands.
///
/// Variant order matters: `Low < Normal < High` so the queue can compare
/// bands directly when choosing an insertion point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandPriority {
    Low,
    Normal,
    High,
}

impl Default for CommandPriority {
    fn default() -> Self {
        CommandPriority::Normal
    }
}

/// One fleet member as seen by the registry and by observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Opaque identifier, stable across reconnects. Immutable once assigned.
    pub device_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub status: LivenessStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Reported attributes (battery, storage, installed apps, location).
    /// Opaque to the hub core; collected and interpreted elsewhere.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub attributes: serde_json::Value,
}

impl DeviceRecord {
    /// Creates a fresh offline record for a previously unknown identifier.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            name: String::new(),
            status: LivenessStatus::Offline,
            last_seen: None,
            last_heartbeat: None,
            attributes: serde_json::Value::Null,
        }
    }

    /// Derived "last activity" value used by the merge rule: the greater of
    /// last-heartbeat and last-seen.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        match (self.last_seen, self.last_heartbeat) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}
