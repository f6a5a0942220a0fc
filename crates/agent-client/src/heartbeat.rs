//! Activity-driven heartbeat cadence.
//!
//! The agent heartbeats slowly while the device sits idle and speeds up
//! while it is actively used, so a busy device's liveness view is
//! tighter exactly when an operator is most likely watching it. The
//! link task watches the flag and re-arms its ping timer on changes,
//! sending one ping immediately on the idle-to-active edge.

use tokio::sync::watch;
use tokio::time::Duration;

/// Flips the agent between idle and active heartbeat cadence.
///
/// Cloneable; the agent binary holds one and toggles it from whatever
/// signal means "in use" on the platform (input events, screen state).
#[derive(Clone)]
pub struct ActivityHandle {
    tx: watch::Sender<bool>,
}

impl ActivityHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }

    /// Marks the device active or idle. Sending the current value again
    /// is a no-op and wakes nobody.
    pub fn set_active(&self, active: bool) {
        self.tx.send_if_modified(|current| {
            if *current == active {
                false
            } else {
                *current = active;
                true
            }
        });
    }

    pub fn is_active(&self) -> bool {
        *self.tx.borrow()
    }
}

/// The heartbeat period for the given activity state.
pub(crate) fn period_for(active: bool, idle: Duration, active_period: Duration) -> Duration {
    if active { active_period } else { idle }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_idle() {
        let (handle, rx) = ActivityHandle::new();
        assert!(!handle.is_active());
        assert!(!*rx.borrow());
    }

    #[tokio::test]
    async fn toggle_wakes_watcher_once() {
        let (handle, mut rx) = ActivityHandle::new();

        handle.set_active(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());

        // Same value again must not signal a change.
        handle.set_active(true);
        assert!(!rx.has_changed().unwrap());

        handle.set_active(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
    }

    #[test]
    fn period_tracks_activity() {
        let idle = Duration::from_secs(60);
        let active = Duration::from_secs(15);
        assert_eq!(period_for(false, idle, active), idle);
        assert_eq!(period_for(true, idle, active), active);
    }
}
