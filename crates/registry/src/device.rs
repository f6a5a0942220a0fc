use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use fleetlink_protocol::types::{DeviceRecord, LivenessStatus};

/// Identifier for a live transport connection, assigned by the hub server.
pub type ConnId = u64;

/// One device's slice of registry state, guarded by its own mutex.
#[derive(Debug)]
pub struct DeviceEntry {
    pub(crate) record: DeviceRecord,
    /// The connection currently bound to this identifier, if any. A newly
    /// identified connection for the same identifier supersedes the old
    /// binding; events from the superseded connection are then stale.
    pub(crate) conn: Option<ConnId>,
    /// Cancellation handle for a pending grace-period offline commit.
    pub(crate) grace: Option<CancellationToken>,
}

impl DeviceEntry {
    pub(crate) fn new(record: DeviceRecord) -> Self {
        Self {
            record,
            conn: None,
            grace: None,
        }
    }

    pub fn record(&self) -> &DeviceRecord {
        &self.record
    }

    pub fn connection(&self) -> Option<ConnId> {
        self.conn
    }

    /// Moves last-seen forward. Regressions are ignored: last-seen is
    /// monotonic by invariant.
    pub(crate) fn touch_seen(&mut self, at: DateTime<Utc>) {
        if self.record.last_seen.is_none_or(|prev| at > prev) {
            self.record.last_seen = Some(at);
        }
    }

    pub(crate) fn touch_heartbeat(&mut self, at: DateTime<Utc>) {
        if self.record.last_heartbeat.is_none_or(|prev| at > prev) {
            self.record.last_heartbeat = Some(at);
        }
    }

    /// The only status mutator in the crate. Deliberately `pub(crate)`:
    /// everything outside the reconciler updates attributes and bindings,
    /// never liveness.
    pub(crate) fn set_status(&mut self, status: LivenessStatus) -> bool {
        if self.record.status == status {
            return false;
        }
        self.record.status = status;
        true
    }

    /// Cancels a pending deferred-offline commit, if any.
    pub(crate) fn cancel_grace(&mut self) {
        if let Some(token) = self.grace.take() {
            token.cancel();
        }
    }
}
