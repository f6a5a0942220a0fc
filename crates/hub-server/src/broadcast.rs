//! Observer notification fan-out.

use std::collections::HashMap;
use std::sync::Mutex;

use fleetlink_protocol::constants::MessageType;
use fleetlink_protocol::envelope::Message;
use fleetlink_registry::ConnId;
use serde::Serialize;

use crate::connection::{SendError, Sender};

/// Registered observer connections and the fan-out over them.
///
/// Each observer has its own send buffer, so per-observer delivery order
/// matches emission order even while observers drain at different
/// speeds. A sender whose connection is gone is dropped from the set on
/// the next notification; one whose buffer is merely full stays and
/// misses that notification.
#[derive(Default)]
pub struct ObserverBroadcast {
    observers: Mutex<HashMap<ConnId, Sender>>,
}

impl ObserverBroadcast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn: ConnId, sender: Sender) {
        self.observers.lock().unwrap().insert(conn, sender);
    }

    /// Removes an observer; returns `true` if it was registered.
    pub fn remove(&self, conn: ConnId) -> bool {
        self.observers
            .lock()
            .unwrap()
            .remove(&conn)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.observers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sends one notification to every registered observer.
    ///
    /// Observers whose connection is gone are removed so the set heals
    /// itself. A full send buffer is transient backpressure on a live
    /// connection: the observer keeps its membership and misses this
    /// notification (it can re-snapshot to catch up).
    pub fn notify<T: Serialize>(&self, msg_type: MessageType, payload: Option<&T>) {
        let msg = match Message::new(uuid::Uuid::new_v4().to_string(), msg_type, payload) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(?msg_type, "failed to encode notification: {e}");
                return;
            }
        };

        let mut observers = self.observers.lock().unwrap();
        observers.retain(|conn, sender| match sender.send_msg(&msg) {
            Ok(()) => true,
            Err(SendError::Closed) => {
                tracing::debug!(conn, "dropping disconnected observer");
                false
            }
            Err(e) => {
                tracing::warn!(conn, "observer notification dropped: {e}");
                true
            }
        });
    }
}
