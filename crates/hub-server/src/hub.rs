//! Hub wiring: registry, reconciler, dispatcher, observers, routing.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleetlink_dispatch::dispatcher::{
    DeliveryPort, DispatchEvent, Dispatcher, DispatcherConfig,
};
use fleetlink_dispatch::queue::QueuedCommand;
use fleetlink_protocol::constants::{
    MessageType, WS_CLOSE_SUPERSEDED, WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_NOT_IMPLEMENTED,
    WS_REQUEST_TIMEOUT,
};
use fleetlink_protocol::envelope::Message;
use fleetlink_protocol::messages::{
    CommandDelivery, CommandFailedEvent, CommandQueuedResponse, CommandRequest, DeviceListReport,
    DeviceRef, DeviceReport, PingPayload, PongPayload, SnapshotResponse,
};
use fleetlink_protocol::types::DeviceRecord;
use fleetlink_registry::reconciler::{Reconciler, ReconcilerConfig};
use fleetlink_registry::registry::DeviceRegistry;
use fleetlink_registry::{ConnId, ProbePort, RegistryEvent};
use fleetlink_store::{DeviceStore, StoreError};

use crate::broadcast::ObserverBroadcast;
use crate::connection::{ConnHandle, FrameHandler, HandlerFuture, Sender};

/// Timing and threshold knobs for the hub's background work.
#[derive(Debug, Clone)]
pub struct HubTuning {
    pub reconciler: ReconcilerConfig,
    pub dispatcher: DispatcherConfig,
    /// Period of the full-fleet liveness sweep.
    pub sweep_period: Duration,
    /// Period of the offline-queue retry drain.
    pub dispatch_tick: Duration,
    /// Health score below which a device is reported unhealthy.
    pub health_threshold: f64,
    /// Period of the unhealthy-device report.
    pub health_report_period: Duration,
}

impl Default for HubTuning {
    fn default() -> Self {
        Self {
            reconciler: ReconcilerConfig::default(),
            dispatcher: DispatcherConfig::default(),
            sweep_period: Duration::from_secs(10),
            dispatch_tick: Duration::from_secs(5),
            health_threshold: 0.5,
            health_report_period: Duration::from_secs(60),
        }
    }
}

/// Connection table plus the two transport ports the liveness and
/// dispatch crates need: out-of-band probes and command delivery with
/// ack correlation.
struct WirePort {
    registry: Arc<DeviceRegistry>,
    conns: Mutex<HashMap<ConnId, ConnHandle>>,
    /// Outstanding `command_delivery` requests keyed by envelope id.
    pending_acks: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl WirePort {
    fn new(registry: Arc<DeviceRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            conns: Mutex::new(HashMap::new()),
            pending_acks: Mutex::new(HashMap::new()),
        })
    }

    fn insert(&self, handle: ConnHandle) {
        self.conns.lock().unwrap().insert(handle.meta.conn_id, handle);
    }

    fn remove(&self, conn: ConnId) -> Option<ConnHandle> {
        self.conns.lock().unwrap().remove(&conn)
    }

    fn sender(&self, conn: ConnId) -> Option<Sender> {
        self.conns.lock().unwrap().get(&conn).map(ConnHandle::sender)
    }

    fn open_connections(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    /// Resolves a pending delivery by envelope id. `false` if nothing
    /// was waiting (late or duplicate ack).
    fn complete_ack(&self, msg_id: &str) -> bool {
        match self.pending_acks.lock().unwrap().remove(msg_id) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

impl ProbePort for WirePort {
    fn probe(&self, device_id: &str, conn: ConnId) -> bool {
        let Some(sender) = self.sender(conn) else {
            return false;
        };
        let ping = PingPayload {
            timestamp: Utc::now().timestamp_millis(),
        };
        match Message::new(
            uuid::Uuid::new_v4().to_string(),
            MessageType::Ping,
            Some(&ping),
        ) {
            Ok(msg) => {
                debug!(device = device_id, conn, "sending liveness probe");
                sender.send_msg(&msg).is_ok()
            }
            Err(_) => false,
        }
    }
}

impl DeliveryPort for WirePort {
    fn deliver(
        &self,
        command: &QueuedCommand,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        let command = command.clone();
        Box::pin(async move {
            let Some(conn) = self.registry.connection_of(&command.device_id).await else {
                return false;
            };
            let Some(sender) = self.sender(conn) else {
                return false;
            };

            let delivery = CommandDelivery {
                queue_id: command.queue_id.clone(),
                name: command.name.clone(),
                payload: command.payload.clone(),
            };
            let msg_id = uuid::Uuid::new_v4().to_string();
            let Ok(msg) = Message::new(&msg_id, MessageType::CommandDelivery, Some(&delivery))
            else {
                return false;
            };

            let (tx, rx) = oneshot::channel();
            self.pending_acks.lock().unwrap().insert(msg_id.clone(), tx);
            if sender.send_msg(&msg).is_err() {
                self.pending_acks.lock().unwrap().remove(&msg_id);
                return false;
            }

            match tokio::time::timeout(WS_REQUEST_TIMEOUT, rx).await {
                Ok(Ok(())) => true,
                _ => {
                    self.pending_acks.lock().unwrap().remove(&msg_id);
                    debug!(
                        device = command.device_id,
                        queue_id = command.queue_id,
                        "delivery not acknowledged"
                    );
                    false
                }
            }
        })
    }
}

/// The hub's coordination core, shared by every connection task.
pub struct FleetHub {
    registry: Arc<DeviceRegistry>,
    reconciler: Arc<Reconciler>,
    dispatcher: Arc<Dispatcher>,
    wire: Arc<WirePort>,
    observers: ObserverBroadcast,
    tuning: HubTuning,
    /// Event receivers, consumed once by [`FleetHub::run_background`].
    events: AsyncMutex<Option<(mpsc::Receiver<RegistryEvent>, mpsc::Receiver<DispatchEvent>)>>,
}

impl FleetHub {
    pub fn new(store: Arc<dyn DeviceStore>, tuning: HubTuning) -> Arc<Self> {
        let (registry, registry_events) = DeviceRegistry::new(store);
        let wire = WirePort::new(Arc::clone(&registry));
        let reconciler = Reconciler::new(
            Arc::clone(&registry),
            Arc::clone(&wire) as Arc<dyn ProbePort>,
            tuning.reconciler.clone(),
        );
        let (dispatcher, dispatch_events) = Dispatcher::new(
            Arc::clone(&wire) as Arc<dyn DeliveryPort>,
            tuning.dispatcher.clone(),
        );

        Arc::new(Self {
            registry,
            reconciler,
            dispatcher,
            wire,
            observers: ObserverBroadcast::new(),
            tuning,
            events: AsyncMutex::new(Some((registry_events, dispatch_events))),
        })
    }

    /// Loads persisted devices into the registry, all marked offline.
    pub async fn seed(&self) -> Result<usize, StoreError> {
        self.registry.seed().await
    }

    /// Current device snapshot, sorted by identifier.
    pub async fn snapshot(&self) -> Vec<DeviceRecord> {
        self.registry.snapshot().await
    }

    pub fn open_connections(&self) -> usize {
        self.wire.open_connections()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Adopts a freshly upgraded connection.
    pub fn register_connection(&self, handle: ConnHandle) {
        self.wire.insert(handle);
    }

    /// Spawns the hub's recurring work: registry and dispatch event
    /// fan-out, the liveness sweep, the queue drain, and the health
    /// report. All tasks stop on cancellation.
    pub async fn run_background(self: &Arc<Self>, cancel: &CancellationToken) {
        let Some((mut registry_events, mut dispatch_events)) = self.events.lock().await.take()
        else {
            warn!("background tasks already running");
            return;
        };

        let hub = Arc::clone(self);
        let stop = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    event = registry_events.recv() => match event {
                        Some(event) => hub.forward_registry_event(event),
                        None => break,
                    },
                }
            }
        });

        let hub = Arc::clone(self);
        let stop = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    event = dispatch_events.recv() => match event {
                        Some(event) => hub.forward_dispatch_event(event),
                        None => break,
                    },
                }
            }
        });

        let hub = Arc::clone(self);
        let stop = cancel.clone();
        let sweep_period = self.tuning.sweep_period;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => hub.reconciler.sweep().await,
                }
            }
        });

        tokio::spawn(
            Arc::clone(&self.dispatcher).run(self.tuning.dispatch_tick, cancel.child_token()),
        );

        let hub = Arc::clone(self);
        let stop = cancel.clone();
        let report_period = self.tuning.health_report_period;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(report_period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        for (device_id, score) in
                            hub.reconciler.unhealthy_devices(hub.tuning.health_threshold)
                        {
                            warn!(device = %device_id, score, "device health below threshold");
                        }
                    }
                }
            }
        });
    }

    fn forward_registry_event(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::DeviceConnected(record) => {
                self.observers
                    .notify(MessageType::DeviceConnected, Some(&record));
            }
            RegistryEvent::DeviceStatusUpdate(record) => {
                self.observers
                    .notify(MessageType::DeviceStatusUpdate, Some(&record));
            }
            RegistryEvent::DeviceDisconnected { device_id } => {
                self.observers
                    .notify(MessageType::DeviceDisconnected, Some(&DeviceRef { device_id }));
            }
        }
    }

    fn forward_dispatch_event(&self, event: DispatchEvent) {
        match event {
            DispatchEvent::Delivered {
                queue_id,
                device_id,
            } => {
                debug!(device = %device_id, queue_id, "command delivered");
            }
            DispatchEvent::Failed {
                queue_id,
                device_id,
                reason,
            } => {
                self.observers.notify(
                    MessageType::CommandFailed,
                    Some(&CommandFailedEvent {
                        queue_id,
                        device_id,
                        reason,
                    }),
                );
            }
        }
    }

    async fn route(&self, conn: ConnId, sender: Sender, msg: Message) {
        match msg.msg_type {
            MessageType::DeviceStatus => self.on_device_status(conn, &sender, msg).await,
            MessageType::Ping => self.on_ping(conn, &sender, msg).await,
            MessageType::Pong => self.on_pong(conn, msg).await,
            MessageType::ObserverIdentify => self.on_observer_identify(conn, &sender, msg).await,
            MessageType::Command => self.on_command(&sender, msg).await,
            MessageType::CommandAck => self.on_command_ack(conn, &msg),
            MessageType::DeviceList => self.on_device_list(&sender, msg).await,
            MessageType::Error => {
                warn!(conn, error = ?msg.error, "peer reported error");
            }
            MessageType::Unknown => {
                warn!(conn, "unknown message type ignored");
            }
            other => {
                warn!(conn, msg_type = ?other, "unexpected message type");
                let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "unexpected message type");
            }
        }
    }

    async fn on_device_status(&self, conn: ConnId, sender: &Sender, msg: Message) {
        let report: DeviceReport = match msg.parse_payload::<DeviceReport>() {
            Ok(Some(report)) if !report.device_id.is_empty() => report,
            _ => {
                let _ = sender.send_error(
                    &msg,
                    WS_ERR_CODE_BAD_REQUEST,
                    "malformed device_status payload",
                );
                return;
            }
        };
        let device_id = report.device_id.clone();

        let ingest = self.reconciler.ingest_status(report, conn).await;
        if let Some(old) = ingest.superseded {
            info!(device = %device_id, old, new = conn, "closing superseded connection");
            if let Some(old_sender) = self.wire.sender(old) {
                let _ = old_sender
                    .send_close(WS_CLOSE_SUPERSEDED, "superseded by a newer connection");
            }
        }

        if let Ok(reply) = msg.reply(MessageType::DeviceStatusAck, Option::<&()>::None) {
            let _ = sender.send_msg(&reply);
        }

        // The device just proved reachable; try its backlog right away.
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move { dispatcher.drain_device(&device_id).await });
    }

    async fn on_ping(&self, conn: ConnId, sender: &Sender, msg: Message) {
        let timestamp = msg
            .parse_payload::<PingPayload>()
            .ok()
            .flatten()
            .map(|p| p.timestamp)
            .unwrap_or_default();
        let pong = PongPayload {
            timestamp,
            server_time: Utc::now().timestamp_millis(),
        };
        if let Ok(reply) = msg.reply(MessageType::Pong, Some(&pong)) {
            let _ = sender.send_msg(&reply);
        }
        if let Some(device_id) = self.registry.device_of(conn) {
            self.reconciler.heartbeat(&device_id).await;
        }
    }

    async fn on_pong(&self, conn: ConnId, msg: Message) {
        let Some(device_id) = self.registry.device_of(conn) else {
            return;
        };
        let Ok(Some(pong)) = msg.parse_payload::<PongPayload>() else {
            self.reconciler.heartbeat(&device_id).await;
            return;
        };
        // Clock skew can make the echo look like it arrived early.
        let elapsed = (Utc::now().timestamp_millis() - pong.timestamp).max(0) as u64;
        self.reconciler
            .record_round_trip(&device_id, Duration::from_millis(elapsed))
            .await;
    }

    async fn on_observer_identify(&self, conn: ConnId, sender: &Sender, msg: Message) {
        self.observers.add(conn, sender.clone());
        let snapshot = SnapshotResponse {
            devices: self.registry.snapshot().await,
        };
        if let Ok(reply) = msg.reply(MessageType::DeviceSnapshot, Some(&snapshot)) {
            let _ = sender.send_msg(&reply);
        }
        info!(conn, observers = self.observers.len(), "observer identified");
    }

    async fn on_command(&self, sender: &Sender, msg: Message) {
        let request: CommandRequest = match msg.parse_payload::<CommandRequest>() {
            Ok(Some(req)) if !req.device_id.is_empty() && !req.name.is_empty() => req,
            _ => {
                let _ = sender.send_error(&msg, WS_ERR_CODE_BAD_REQUEST, "malformed command payload");
                return;
            }
        };

        let connected = self
            .registry
            .connection_of(&request.device_id)
            .await
            .is_some();
        let device_id = request.device_id.clone();
        let queue_id = self
            .dispatcher
            .enqueue(
                &request.device_id,
                &request.name,
                request.payload,
                request.priority,
                request.max_attempts,
            )
            .await;

        let response = CommandQueuedResponse {
            queue_id,
            queued: !connected,
        };
        if let Ok(reply) = msg.reply(MessageType::CommandQueued, Some(&response)) {
            let _ = sender.send_msg(&reply);
        }

        if connected {
            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move { dispatcher.drain_device(&device_id).await });
        }
    }

    fn on_command_ack(&self, conn: ConnId, msg: &Message) {
        if !self.wire.complete_ack(&msg.id) {
            debug!(conn, id = msg.id, "unmatched command ack");
        }
    }

    async fn on_device_list(&self, sender: &Sender, msg: Message) {
        let report: DeviceListReport = match msg.parse_payload() {
            Ok(Some(report)) => report,
            _ => {
                let _ = sender.send_error(
                    &msg,
                    WS_ERR_CODE_BAD_REQUEST,
                    "malformed device_list payload",
                );
                return;
            }
        };
        debug!(devices = report.devices.len(), "ingesting bulk device list");
        self.reconciler.ingest_bulk(report.devices).await;
    }
}

impl FrameHandler for FleetHub {
    fn on_message(&self, conn: ConnId, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(self.route(conn, sender, msg))
    }

    fn on_disconnected(&self, conn: ConnId, normal: bool) -> HandlerFuture<'_> {
        Box::pin(async move {
            self.wire.remove(conn);
            if self.observers.remove(conn) {
                debug!(conn, "observer unregistered");
            }
            self.reconciler.handle_disconnect(conn, normal).await;
        })
    }
}
