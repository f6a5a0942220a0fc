//! Authoritative in-memory device registry and liveness reconciler.
//!
//! Two asynchronous signal sources feed liveness: transport connect and
//! disconnect events from the hub server, and a periodic sweep comparing
//! each device's last-seen time against its adaptive timeout. Status
//! transitions happen only inside the reconciler; connection handlers
//! update attributes and bindings but can never flip a device online or
//! offline themselves.
//!
//! Locking follows the one-mutator-per-identifier rule: the outer map
//! lock is held only to look up or insert an entry, and each device has
//! its own mutex. Sweeps iterate over a snapshot of the entry handles so
//! a full-fleet scan never blocks concurrent per-connection writers.

pub mod device;
mod merge;
pub mod reconciler;
pub mod registry;

pub use device::ConnId;
pub use reconciler::{ProbePort, Reconciler, ReconcilerConfig};
pub use registry::DeviceRegistry;

use fleetlink_protocol::DeviceRecord;

/// Registry change notifications, fanned out to observers by the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// A device transitioned to online.
    DeviceConnected(DeviceRecord),
    /// An online device refreshed its status/attributes.
    DeviceStatusUpdate(DeviceRecord),
    /// A device transitioned to offline (or was removed).
    DeviceDisconnected { device_id: String },
}
