use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::warn;

use fleetlink_protocol::DeviceRecord;
use fleetlink_store::DeviceStore;

use crate::RegistryEvent;
use crate::device::{ConnId, DeviceEntry};

/// Capacity of the registry event channel.
const EVENT_BUFFER: usize = 256;

/// Authoritative map from device identifier to per-device state.
///
/// A cache in front of the durable [`DeviceStore`]: mutations worth
/// surviving a restart are forwarded to the store, and [`seed`] reads
/// them back at startup.
///
/// [`seed`]: DeviceRegistry::seed
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Arc<Mutex<DeviceEntry>>>>,
    /// Reverse index from live connection to its claimed device.
    conn_index: std::sync::RwLock<HashMap<ConnId, String>>,
    events_tx: mpsc::Sender<RegistryEvent>,
    store: Arc<dyn DeviceStore>,
}

impl DeviceRegistry {
    /// Creates a registry and the receiver for its change notifications.
    pub fn new(store: Arc<dyn DeviceStore>) -> (Arc<Self>, mpsc::Receiver<RegistryEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let registry = Arc::new(Self {
            devices: RwLock::new(HashMap::new()),
            conn_index: std::sync::RwLock::new(HashMap::new()),
            events_tx,
            store,
        });
        (registry, events_rx)
    }

    /// Seeds the registry from the durable store. All seeded devices start
    /// offline regardless of their persisted status: no connection can
    /// exist yet, and the reconciler will flip them back as agents return.
    pub async fn seed(&self) -> Result<usize, fleetlink_store::StoreError> {
        let records = self.store.load_all()?;
        let count = records.len();
        let mut map = self.devices.write().await;
        for mut record in records {
            record.status = fleetlink_protocol::LivenessStatus::Offline;
            map.insert(
                record.device_id.clone(),
                Arc::new(Mutex::new(DeviceEntry::new(record))),
            );
        }
        Ok(count)
    }

    /// Looks up the entry handle for a device, creating it if unknown.
    pub(crate) async fn entry_or_create(&self, device_id: &str) -> Arc<Mutex<DeviceEntry>> {
        if let Some(entry) = self.devices.read().await.get(device_id) {
            return entry.clone();
        }
        let mut map = self.devices.write().await;
        map.entry(device_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(DeviceEntry::new(DeviceRecord::new(device_id)))))
            .clone()
    }

    pub(crate) async fn entry(&self, device_id: &str) -> Option<Arc<Mutex<DeviceEntry>>> {
        self.devices.read().await.get(device_id).cloned()
    }

    /// Consistent snapshot of entry handles for full-fleet iteration. The
    /// map lock is released before any entry is locked.
    pub(crate) async fn entries(&self) -> Vec<(String, Arc<Mutex<DeviceEntry>>)> {
        self.devices
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    /// Current device records, for observer snapshots and the polling
    /// endpoint. Entries are locked one at a time, not for the whole scan.
    pub async fn snapshot(&self) -> Vec<DeviceRecord> {
        let handles = self.entries().await;
        let mut out = Vec::with_capacity(handles.len());
        for (_, entry) in handles {
            out.push(entry.lock().await.record.clone());
        }
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        out
    }

    /// One device's current record.
    pub async fn get(&self, device_id: &str) -> Option<DeviceRecord> {
        let entry = self.entry(device_id).await?;
        let record = entry.lock().await.record.clone();
        Some(record)
    }

    /// The connection currently bound to a device, if any.
    pub async fn connection_of(&self, device_id: &str) -> Option<ConnId> {
        let entry = self.entry(device_id).await?;
        let conn = entry.lock().await.conn;
        conn
    }

    /// The device a connection has claimed, if it identified itself.
    pub fn device_of(&self, conn: ConnId) -> Option<String> {
        self.conn_index.read().unwrap().get(&conn).cloned()
    }

    pub(crate) fn index_connection(&self, conn: ConnId, device_id: &str) {
        self.conn_index
            .write()
            .unwrap()
            .insert(conn, device_id.to_owned());
    }

    pub(crate) fn unindex_connection(&self, conn: ConnId) {
        self.conn_index.write().unwrap().remove(&conn);
    }

    /// Removes a device entirely. The core never does this on its own;
    /// deletion is an external administrative action forwarded here.
    pub async fn remove(&self, device_id: &str) {
        let removed = self.devices.write().await.remove(device_id);
        if let Some(entry) = removed {
            let mut guard = entry.lock().await;
            guard.cancel_grace();
            if let Some(conn) = guard.conn.take() {
                self.unindex_connection(conn);
            }
            if let Err(e) = self.store.remove(device_id) {
                warn!(device = %device_id, "store removal failed: {e}");
            }
            self.emit(RegistryEvent::DeviceDisconnected {
                device_id: device_id.to_owned(),
            })
            .await;
        }
    }

    /// Forwards a mutated record to the durable store. Store failures are
    /// logged, never propagated: the in-memory view stays authoritative
    /// for the rest of the session.
    pub(crate) fn persist(&self, record: &DeviceRecord) {
        if let Err(e) = self.store.upsert(record) {
            warn!(device = %record.device_id, "store upsert failed: {e}");
        }
    }

    pub(crate) async fn emit(&self, event: RegistryEvent) {
        if self.events_tx.send(event).await.is_err() {
            warn!("registry event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetlink_protocol::LivenessStatus;
    use fleetlink_store::MemoryStore;

    fn store_with(records: &[DeviceRecord]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for rec in records {
            store.upsert(rec).unwrap();
        }
        store
    }

    #[tokio::test]
    async fn seed_marks_everything_offline() {
        let mut rec = DeviceRecord::new("d1");
        rec.status = LivenessStatus::Online;
        let store = store_with(&[rec]);
        let (registry, _rx) = DeviceRegistry::new(store);

        assert_eq!(registry.seed().await.unwrap(), 1);
        let snap = registry.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].status, LivenessStatus::Offline);
    }

    #[tokio::test]
    async fn entry_or_create_is_idempotent() {
        let (registry, _rx) = DeviceRegistry::new(Arc::new(MemoryStore::new()));
        let a = registry.entry_or_create("d1").await;
        let b = registry.entry_or_create("d1").await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn snapshot_is_sorted_by_id() {
        let (registry, _rx) = DeviceRegistry::new(Arc::new(MemoryStore::new()));
        registry.entry_or_create("zeta").await;
        registry.entry_or_create("alpha").await;
        let snap = registry.snapshot().await;
        assert_eq!(snap[0].device_id, "alpha");
        assert_eq!(snap[1].device_id, "zeta");
    }

    #[tokio::test]
    async fn remove_forwards_to_store_and_notifies() {
        let rec = DeviceRecord::new("d1");
        let store = store_with(&[rec]);
        let (registry, mut rx) = DeviceRegistry::new(store.clone());
        registry.seed().await.unwrap();

        registry.remove("d1").await;

        assert!(registry.get("d1").await.is_none());
        assert!(store.load_all().unwrap().is_empty());
        assert_eq!(
            rx.recv().await,
            Some(RegistryEvent::DeviceDisconnected {
                device_id: "d1".into()
            })
        );
    }

    #[tokio::test]
    async fn connection_index_roundtrip() {
        let (registry, _rx) = DeviceRegistry::new(Arc::new(MemoryStore::new()));
        registry.index_connection(7, "d1");
        assert_eq!(registry.device_of(7), Some("d1".to_owned()));
        registry.unindex_connection(7);
        assert_eq!(registry.device_of(7), None);
    }
}
