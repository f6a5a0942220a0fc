//! Drain logic for the offline command queue.
//!
//! The dispatcher holds the shared [`CommandQueue`] and drives delivery
//! attempts against a [`DeliveryPort`] implemented by the hub on top of
//! the actual WebSocket transport. Drain is sequential, one in-flight
//! command at a time, so a device reconnecting into a deep backlog does
//! not get hit with a burst.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleetlink_protocol::constants;
use fleetlink_protocol::types::CommandPriority;

use crate::queue::{CommandQueue, QueuedCommand};

/// Abstract delivery channel to a connected device.
///
/// The hub implements this trait on top of its connection table. Using a
/// trait keeps drain logic decoupled from transport and testable with mocks.
pub trait DeliveryPort: Send + Sync {
    /// Attempts to deliver one command over the device's current
    /// connection and waits for the agent's acknowledgement. Returns
    /// `false` when the device has no connection, the send fails, or
    /// the acknowledgement does not arrive in time.
    fn deliver(
        &self,
        command: &QueuedCommand,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;
}

/// Outcome notifications surfaced to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    Delivered {
        queue_id: String,
        device_id: String,
    },
    Failed {
        queue_id: String,
        device_id: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Commands older than this are dropped undelivered.
    pub expiry: Duration,
    /// Delay before the first delivery attempt; doubles per attempt.
    pub base_retry_delay: Duration,
    /// Ceiling for the per-attempt delay.
    pub max_retry_delay: Duration,
    /// Attempt cap applied when a request does not specify one.
    pub default_max_attempts: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            expiry: constants::COMMAND_EXPIRY,
            base_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            default_max_attempts: constants::COMMAND_DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Priority-aware command dispatcher with at-least-once delivery.
pub struct Dispatcher {
    queue: Mutex<CommandQueue>,
    port: Arc<dyn DeliveryPort>,
    config: DispatcherConfig,
    events_tx: mpsc::Sender<DispatchEvent>,
    // Guards against two concurrent drains racing on one device's head.
    draining: Mutex<HashSet<String>>,
}

impl Dispatcher {
    pub fn new(
        port: Arc<dyn DeliveryPort>,
        config: DispatcherConfig,
    ) -> (Arc<Self>, mpsc::Receiver<DispatchEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let dispatcher = Arc::new(Self {
            queue: Mutex::new(CommandQueue::new()),
            port,
            config,
            events_tx,
            draining: Mutex::new(HashSet::new()),
        });
        (dispatcher, events_rx)
    }

    /// Parks a command for a device and returns its queue id.
    ///
    /// A `max_attempts` of zero means "use the configured default".
    pub async fn enqueue(
        &self,
        device_id: &str,
        name: &str,
        payload: serde_json::Value,
        priority: CommandPriority,
        max_attempts: u32,
    ) -> String {
        let cap = if max_attempts == 0 {
            self.config.default_max_attempts
        } else {
            max_attempts
        };
        let mut queue = self.queue.lock().await;
        let queue_id = queue.enqueue(device_id, name, payload, priority, cap);
        info!(
            device_id,
            queue_id,
            command = name,
            backlog = queue.len(device_id),
            "command queued"
        );
        queue_id
    }

    /// Drops the whole backlog for a device, reporting each entry failed.
    pub async fn clear_device(&self, device_id: &str) -> usize {
        let mut queue = self.queue.lock().await;
        let mut dropped = 0;
        while let Some(cmd) = queue.pop(device_id) {
            dropped += 1;
            self.report_failure(&cmd, "queue cleared").await;
        }
        dropped
    }

    /// Backlog depth for one device.
    pub async fn backlog(&self, device_id: &str) -> usize {
        self.queue.lock().await.len(device_id)
    }

    /// Devices that currently have parked commands.
    pub async fn backlogged_devices(&self) -> Vec<String> {
        self.queue.lock().await.backlogged_devices()
    }

    /// Periodic drain loop; also the retry ticker for stuck heads.
    pub async fn run(self: Arc<Self>, tick: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("dispatch loop stopped");
                    return;
                }
                _ = interval.tick() => {
                    let devices = self.backlogged_devices().await;
                    for device_id in devices {
                        self.drain_device(&device_id).await;
                    }
                }
            }
        }
    }

    /// Attempts delivery of at most one command for a device.
    ///
    /// Called from the drain loop and directly by the hub when a device
    /// (re)connects, so a fresh connection gets its backlog promptly
    /// instead of waiting for the next tick.
    pub async fn drain_device(&self, device_id: &str) {
        {
            let mut draining = self.draining.lock().await;
            if !draining.insert(device_id.to_owned()) {
                return;
            }
        }
        self.drain_one(device_id).await;
        self.draining.lock().await.remove(device_id);
    }

    async fn drain_one(&self, device_id: &str) {
        // Shed expired or exhausted heads first, then make at most one
        // delivery attempt. Failed attempts leave the command at the
        // head for the next tick.
        let command = loop {
            let mut queue = self.queue.lock().await;
            let Some(head) = queue.head_mut(device_id) else {
                return;
            };
            if head.created_at.elapsed() < self.config.expiry && head.attempts < head.max_attempts
            {
                head.attempts += 1;
                break head.clone();
            }
            let reason = if head.attempts >= head.max_attempts {
                "delivery attempts exhausted"
            } else {
                "expired before delivery"
            };
            if let Some(cmd) = queue.pop(device_id) {
                drop(queue);
                self.report_failure(&cmd, reason).await;
            }
        };

        let delay = retry_delay(&self.config, command.attempts);
        sleep(delay).await;

        if self.port.deliver(&command).await {
            let mut queue = self.queue.lock().await;
            // The backlog may have been cleared while the ack was in
            // flight; only remove the command we actually delivered.
            if queue
                .head(device_id)
                .is_some_and(|head| head.queue_id == command.queue_id)
            {
                queue.pop(device_id);
            }
            drop(queue);
            info!(
                device_id,
                queue_id = command.queue_id,
                command = command.name,
                attempt = command.attempts,
                "command delivered"
            );
            let _ = self
                .events_tx
                .send(DispatchEvent::Delivered {
                    queue_id: command.queue_id,
                    device_id: device_id.to_owned(),
                })
                .await;
        } else {
            debug!(
                device_id,
                queue_id = command.queue_id,
                attempt = command.attempts,
                max_attempts = command.max_attempts,
                "delivery attempt failed, command stays queued"
            );
        }
    }

    async fn report_failure(&self, command: &QueuedCommand, reason: &str) {
        warn!(
            device_id = command.device_id,
            queue_id = command.queue_id,
            command = command.name,
            reason,
            "command dropped"
        );
        let _ = self
            .events_tx
            .send(DispatchEvent::Failed {
                queue_id: command.queue_id.clone(),
                device_id: command.device_id.clone(),
                reason: reason.to_owned(),
            })
            .await;
    }
}

/// Delay before attempt `n` (1-based): base doubled per attempt, capped.
fn retry_delay(config: &DispatcherConfig, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    config
        .base_retry_delay
        .saturating_mul(factor)
        .min(config.max_retry_delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct StubPort {
        online: AtomicBool,
        deliveries: AtomicU32,
    }

    impl StubPort {
        fn new(online: bool) -> Arc<Self> {
            Arc::new(Self {
                online: AtomicBool::new(online),
                deliveries: AtomicU32::new(0),
            })
        }

        fn set_online(&self, online: bool) {
            self.online.store(online, Ordering::SeqCst);
        }

        fn deliveries(&self) -> u32 {
            self.deliveries.load(Ordering::SeqCst)
        }
    }

    impl DeliveryPort for StubPort {
        fn deliver(
            &self,
            _command: &QueuedCommand,
        ) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
            Box::pin(async {
                if self.online.load(Ordering::SeqCst) {
                    self.deliveries.fetch_add(1, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            })
        }
    }

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            expiry: Duration::from_secs(300),
            base_retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(80),
            default_max_attempts: 5,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delivered_exactly_once_after_reconnect() {
        let port = StubPort::new(false);
        let (dispatcher, mut events) = Dispatcher::new(port.clone(), config());

        dispatcher
            .enqueue("d1", "reboot", serde_json::json!({}), CommandPriority::Normal, 0)
            .await;

        // Device offline: attempts fail, command stays at the head.
        dispatcher.drain_device("d1").await;
        dispatcher.drain_device("d1").await;
        assert_eq!(port.deliveries(), 0);
        assert_eq!(dispatcher.backlog("d1").await, 1);

        // Device reconnects before expiry.
        port.set_online(true);
        dispatcher.drain_device("d1").await;
        assert_eq!(port.deliveries(), 1);
        assert_eq!(dispatcher.backlog("d1").await, 0);

        match events.recv().await {
            Some(DispatchEvent::Delivered { device_id, .. }) => assert_eq!(device_id, "d1"),
            other => panic!("unexpected event: {other:?}"),
        }

        // Nothing left to deliver.
        dispatcher.drain_device("d1").await;
        assert_eq!(port.deliveries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_drop_with_failure_event() {
        let port = StubPort::new(false);
        let (dispatcher, mut events) = Dispatcher::new(port.clone(), config());

        let queue_id = dispatcher
            .enqueue("d1", "reboot", serde_json::json!({}), CommandPriority::High, 2)
            .await;

        dispatcher.drain_device("d1").await;
        dispatcher.drain_device("d1").await;
        assert_eq!(dispatcher.backlog("d1").await, 1);

        // Third pass finds the attempt cap already reached.
        dispatcher.drain_device("d1").await;
        assert_eq!(dispatcher.backlog("d1").await, 0);

        match events.recv().await {
            Some(DispatchEvent::Failed {
                queue_id: failed_id,
                reason,
                ..
            }) => {
                assert_eq!(failed_id, queue_id);
                assert_eq!(reason, "delivery attempts exhausted");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expired_command_dropped_then_next_delivered() {
        let port = StubPort::new(true);
        let (dispatcher, mut events) = Dispatcher::new(port.clone(), config());

        let stale = dispatcher
            .enqueue("d1", "old", serde_json::json!({}), CommandPriority::Normal, 0)
            .await;

        tokio::time::advance(Duration::from_secs(301)).await;

        let fresh = dispatcher
            .enqueue("d1", "new", serde_json::json!({}), CommandPriority::Normal, 0)
            .await;

        dispatcher.drain_device("d1").await;
        assert_eq!(port.deliveries(), 1);
        assert_eq!(dispatcher.backlog("d1").await, 0);

        match events.recv().await {
            Some(DispatchEvent::Failed { queue_id, reason, .. }) => {
                assert_eq!(queue_id, stale);
                assert_eq!(reason, "expired before delivery");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match events.recv().await {
            Some(DispatchEvent::Delivered { queue_id, .. }) => assert_eq!(queue_id, fresh),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_max_attempts_uses_default_cap() {
        let port = StubPort::new(false);
        let (dispatcher, _events) = Dispatcher::new(port.clone(), config());

        dispatcher
            .enqueue("d1", "reboot", serde_json::json!({}), CommandPriority::Normal, 0)
            .await;

        for _ in 0..5 {
            dispatcher.drain_device("d1").await;
            assert_eq!(dispatcher.backlog("d1").await, 1);
        }
        dispatcher.drain_device("d1").await;
        assert_eq!(dispatcher.backlog("d1").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_device_reports_each_entry() {
        let port = StubPort::new(false);
        let (dispatcher, mut events) = Dispatcher::new(port, config());

        dispatcher
            .enqueue("d1", "a", serde_json::json!({}), CommandPriority::Normal, 0)
            .await;
        dispatcher
            .enqueue("d1", "b", serde_json::json!({}), CommandPriority::Low, 0)
            .await;

        assert_eq!(dispatcher.clear_device("d1").await, 2);
        for _ in 0..2 {
            match events.recv().await {
                Some(DispatchEvent::Failed { reason, .. }) => {
                    assert_eq!(reason, "queue cleared")
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let config = config();
        assert_eq!(retry_delay(&config, 1), Duration::from_millis(10));
        assert_eq!(retry_delay(&config, 2), Duration::from_millis(20));
        assert_eq!(retry_delay(&config, 3), Duration::from_millis(40));
        assert_eq!(retry_delay(&config, 4), Duration::from_millis(80));
        assert_eq!(retry_delay(&config, 10), Duration::from_millis(80));
    }
}
