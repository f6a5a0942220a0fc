use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleetlink_liveness::timeout::TimeoutConfig;
use fleetlink_liveness::{AdaptiveTimeout, HealthScorer, PingThrottle};
use fleetlink_protocol::messages::DeviceReport;
use fleetlink_protocol::types::{DeviceRecord, LivenessStatus};

use crate::RegistryEvent;
use crate::device::ConnId;
use crate::merge::merge_report;
use crate::registry::DeviceRegistry;

/// Sends the hub's own out-of-band heartbeat probes.
///
/// Implemented by the hub server over the device's live connection;
/// returns `false` when the send could not even be enqueued (connection
/// gone or its buffer saturated).
pub trait ProbePort: Send + Sync {
    fn probe(&self, device_id: &str, conn: ConnId) -> bool;
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub timeout: TimeoutConfig,
    pub max_probes_per_minute: usize,
    /// Deferral window for offline reports from the secondary bulk channel.
    pub grace: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            timeout: TimeoutConfig::default(),
            max_probes_per_minute: 6,
            grace: Duration::from_secs(45),
        }
    }
}

/// Outcome of ingesting a live status report.
#[derive(Debug)]
pub struct StatusIngest {
    pub record: DeviceRecord,
    /// A previous connection that had claimed the same identifier and is
    /// now superseded; the server should close it.
    pub superseded: Option<ConnId>,
}

/// The only component allowed to change a device's liveness status.
///
/// Absorbs live status reports, transport disconnects, and secondary bulk
/// reports, and runs the periodic sweep. All per-device work happens under
/// that device's entry lock, so a device's own events apply in arrival
/// order while distinct devices proceed concurrently.
pub struct Reconciler {
    registry: Arc<DeviceRegistry>,
    probes: Arc<dyn ProbePort>,
    timeouts: Mutex<AdaptiveTimeout>,
    throttle: Mutex<PingThrottle>,
    health: Mutex<HealthScorer>,
    grace: Duration,
}

impl Reconciler {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        probes: Arc<dyn ProbePort>,
        config: ReconcilerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            probes,
            timeouts: Mutex::new(AdaptiveTimeout::new(config.timeout)),
            throttle: Mutex::new(PingThrottle::new(config.max_probes_per_minute)),
            health: Mutex::new(HealthScorer::new()),
            grace: config.grace,
        })
    }

    /// Ingests a `device_status` from a live agent connection.
    ///
    /// Creates the device on first sight, binds the connection to the
    /// identifier (superseding any previous claim), refreshes attributes
    /// and last-seen, and confirms the device online. This is the only
    /// path that marks a device online from a live connection — a bare
    /// transport open never does (confirmation before liveness).
    pub async fn ingest_status(&self, report: DeviceReport, conn: ConnId) -> StatusIngest {
        let entry = self.registry.entry_or_create(&report.device_id).await;
        let mut guard = entry.lock().await;
        let now = Utc::now();

        let superseded = match guard.conn {
            Some(old) if old != conn => {
                self.registry.unindex_connection(old);
                Some(old)
            }
            _ => None,
        };
        guard.conn = Some(conn);
        self.registry.index_connection(conn, &report.device_id);
        guard.cancel_grace();

        if !report.name.is_empty() {
            guard.record.name = report.name.clone();
        }
        if !report.attributes.is_null() {
            guard.record.attributes = report.attributes.clone();
        }
        guard.touch_seen(now);

        let came_online = guard.set_status(LivenessStatus::Online);
        let record = guard.record.clone();
        self.registry.persist(&record);

        if came_online {
            info!(device = %record.device_id, "device online");
            self.registry
                .emit(RegistryEvent::DeviceConnected(record.clone()))
                .await;
        } else {
            self.registry
                .emit(RegistryEvent::DeviceStatusUpdate(record.clone()))
                .await;
        }

        StatusIngest { record, superseded }
    }

    /// Marks heartbeat activity for a device (agent-initiated ping).
    pub async fn heartbeat(&self, device_id: &str) {
        if let Some(entry) = self.registry.entry(device_id).await {
            let mut guard = entry.lock().await;
            let now = Utc::now();
            guard.touch_heartbeat(now);
            guard.touch_seen(now);
        }
    }

    /// Records a completed hub-probe round trip: feeds the adaptive
    /// timeout estimator and the health score, and refreshes activity.
    pub async fn record_round_trip(&self, device_id: &str, latency: Duration) {
        self.timeouts
            .lock()
            .unwrap()
            .record_round_trip(device_id, latency);
        self.health
            .lock()
            .unwrap()
            .record(device_id, true, Some(latency.as_millis() as u64));
        self.heartbeat(device_id).await;
    }

    /// Records a probe that never completed.
    pub fn record_probe_failure(&self, device_id: &str) {
        self.health.lock().unwrap().record(device_id, false, None);
    }

    /// Rate-limit gate for the hub's own heartbeat probes.
    pub fn may_probe(&self, device_id: &str) -> bool {
        self.throttle.lock().unwrap().can_probe(device_id)
    }

    /// Current adaptive inactivity timeout for a device.
    pub fn timeout_for(&self, device_id: &str) -> Duration {
        self.timeouts.lock().unwrap().timeout_for(device_id)
    }

    /// Long-run health score in `[0, 1]`.
    pub fn health_score(&self, device_id: &str) -> f64 {
        self.health.lock().unwrap().score(device_id)
    }

    /// Devices below the health threshold, worst first. Informational
    /// only; a bad score never forces an offline transition.
    pub fn unhealthy_devices(&self, threshold: f64) -> Vec<(String, f64)> {
        self.health.lock().unwrap().unhealthy(threshold)
    }

    /// Reacts to a transport close. Unbinds the connection and, when the
    /// closing connection was the device's current one, transitions the
    /// device offline. Events from a superseded connection arrive here
    /// too and are ignored as stale.
    pub async fn handle_disconnect(&self, conn: ConnId, normal: bool) {
        let Some(device_id) = self.registry.device_of(conn) else {
            return;
        };
        self.registry.unindex_connection(conn);

        let Some(entry) = self.registry.entry(&device_id).await else {
            return;
        };
        let mut guard = entry.lock().await;
        if guard.conn != Some(conn) {
            debug!(device = %device_id, conn, "ignoring disconnect of superseded connection");
            return;
        }
        guard.conn = None;

        if guard.set_status(LivenessStatus::Offline) {
            info!(device = %device_id, conn, normal, "device offline");
            let record = guard.record.clone();
            self.registry.persist(&record);
            self.registry
                .emit(RegistryEvent::DeviceDisconnected { device_id })
                .await;
        }
    }

    /// One liveness sweep over the whole fleet. Iterates a snapshot of
    /// entry handles, locking one device at a time.
    pub async fn sweep(self: &Arc<Self>) {
        let now = Utc::now();
        for (device_id, entry) in self.registry.entries().await {
            let mut guard = entry.lock().await;
            let timeout = self.timeout_for(&device_id);
            let silent_for = guard
                .record
                .last_seen
                .map(|seen| (now - seen).to_std().unwrap_or(Duration::ZERO));

            match (guard.conn, guard.record.status) {
                // Connection raced ahead of the registry after a fast
                // reconnect: the binding exists but the status lagged.
                (Some(_), LivenessStatus::Offline) => {
                    guard.set_status(LivenessStatus::Online);
                    let record = guard.record.clone();
                    info!(device = %device_id, "device online (reconciled to connection)");
                    self.registry.persist(&record);
                    self.registry
                        .emit(RegistryEvent::DeviceConnected(record))
                        .await;
                }

                // Connected but silent past the warning threshold: probe
                // instead of demoting; demote only if the probe cannot
                // even be sent.
                (Some(conn), LivenessStatus::Online) => {
                    let warning = silent_for.is_none_or(|s| s > timeout / 2);
                    if warning && self.may_probe(&device_id) {
                        debug!(device = %device_id, "silent past warning threshold, probing");
                        if !self.probes.probe(&device_id, conn) {
                            self.record_probe_failure(&device_id);
                            guard.conn = None;
                            self.registry.unindex_connection(conn);
                            guard.set_status(LivenessStatus::Offline);
                            let record = guard.record.clone();
                            warn!(device = %device_id, "probe send failed, device offline");
                            self.registry.persist(&record);
                            self.registry
                                .emit(RegistryEvent::DeviceDisconnected { device_id })
                                .await;
                        }
                    }
                }

                // No connection and stale past the adaptive timeout.
                (None, LivenessStatus::Online) => {
                    if silent_for.is_none_or(|s| s > timeout) {
                        guard.set_status(LivenessStatus::Offline);
                        let record = guard.record.clone();
                        info!(device = %device_id, "device offline (sweep timeout)");
                        self.registry.persist(&record);
                        self.registry
                            .emit(RegistryEvent::DeviceDisconnected { device_id })
                            .await;
                    }
                }

                (None, LivenessStatus::Offline) => {}
            }
        }
    }

    /// Ingests a batch "all devices" report from the secondary channel.
    ///
    /// Attribute conflicts resolve by the last-activity merge rule. A
    /// device the batch claims offline while the registry holds it online
    /// is not flipped immediately: the transition is deferred behind the
    /// grace timer, and a fresh online report cancels it. This keeps one
    /// momentarily stale data source from flickering downstream views.
    pub async fn ingest_bulk(self: &Arc<Self>, devices: Vec<DeviceRecord>) {
        for reported in devices {
            let entry = self.registry.entry_or_create(&reported.device_id).await;
            let mut guard = entry.lock().await;
            let merged = merge_report(&mut guard.record, &reported);

            match reported.status {
                LivenessStatus::Online => {
                    guard.cancel_grace();
                    if guard.set_status(LivenessStatus::Online) {
                        let record = guard.record.clone();
                        info!(device = %record.device_id, "device online (bulk report)");
                        self.registry.persist(&record);
                        self.registry
                            .emit(RegistryEvent::DeviceConnected(record))
                            .await;
                    } else if merged {
                        let record = guard.record.clone();
                        self.registry.persist(&record);
                        self.registry
                            .emit(RegistryEvent::DeviceStatusUpdate(record))
                            .await;
                    }
                }
                LivenessStatus::Offline => {
                    if guard.record.status == LivenessStatus::Online && guard.grace.is_none() {
                        let token = CancellationToken::new();
                        guard.grace = Some(token.clone());
                        debug!(
                            device = %reported.device_id,
                            grace_secs = self.grace.as_secs(),
                            "deferring offline report behind grace period"
                        );
                        tokio::spawn(Arc::clone(self).grace_commit(
                            reported.device_id.clone(),
                            token,
                        ));
                    } else if merged {
                        let record = guard.record.clone();
                        self.registry.persist(&record);
                    }
                }
            }
        }
    }

    /// Commits a deferred offline transition once the grace period
    /// elapses, unless a fresh online report cancelled it. The
    /// check-then-commit runs under the entry lock, the same lock that
    /// guards cancellation, so the two cannot race.
    async fn grace_commit(self: Arc<Self>, device_id: String, token: CancellationToken) {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(device = %device_id, "deferred offline cancelled by fresh activity");
                return;
            }
            _ = tokio::time::sleep(self.grace) => {}
        }

        let Some(entry) = self.registry.entry(&device_id).await else {
            return;
        };
        let mut guard = entry.lock().await;

        // A cancel that lost the select race is caught here: cancellation
        // happens under this same entry lock, and a new timer can only be
        // armed after the old token was cancelled. If our token is still
        // uncancelled, the armed token is ours.
        if token.is_cancelled() || guard.grace.is_none() {
            return;
        }
        guard.grace = None;

        if guard.conn.is_some() {
            debug!(device = %device_id, "deferred offline dropped, device reconnected");
            return;
        }
        if guard.set_status(LivenessStatus::Offline) {
            let record = guard.record.clone();
            info!(device = %device_id, "device offline (grace period elapsed)");
            self.registry.persist(&record);
            self.registry
                .emit(RegistryEvent::DeviceDisconnected { device_id })
                .await;
        }
    }
}
