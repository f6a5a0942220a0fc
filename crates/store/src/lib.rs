//! Persisted-state collaborator for the hub registry.
//!
//! The authoritative, crash-durable device store is external to the core;
//! the in-memory registry is a cache in front of it. Every registry
//! mutation that should survive a restart is forwarded here, and on
//! startup the registry is seeded by reading it back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::debug;

use fleetlink_protocol::DeviceRecord;

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Durable device store interface.
///
/// Methods are synchronous: implementations are expected to be small
/// local writes or in-memory; a networked store would wrap its client in
/// its own runtime handle.
pub trait DeviceStore: Send + Sync {
    /// Reads back all persisted devices (startup seeding).
    fn load_all(&self) -> Result<Vec<DeviceRecord>, StoreError>;

    /// Creates or replaces a device record.
    fn upsert(&self, record: &DeviceRecord) -> Result<(), StoreError>;

    /// Removes a device (external administrative deletion).
    fn remove(&self, device_id: &str) -> Result<(), StoreError>;
}

/// JSON-file-backed store. Records are cached in memory and the whole map
/// is rewritten on each mutation. Fine for fleets of thousands, not
/// millions.
pub struct JsonFileStore {
    path: PathBuf,
    records: RwLock<HashMap<String, DeviceRecord>>,
}

impl JsonFileStore {
    /// Opens the store, loading existing records from disk.
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let records = load_records(&path)?;
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    fn persist(&self) -> Result<(), StoreError> {
        let map = self.records.read().unwrap();
        let json = serde_json::to_string_pretty(&*map)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, json)?;
        debug!("persisted {} device(s) to {:?}", map.len(), self.path);
        Ok(())
    }
}

impl DeviceStore for JsonFileStore {
    fn load_all(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        Ok(self.records.read().unwrap().values().cloned().collect())
    }

    fn upsert(&self, record: &DeviceRecord) -> Result<(), StoreError> {
        {
            let mut map = self.records.write().unwrap();
            map.insert(record.device_id.clone(), record.clone());
        }
        self.persist()
    }

    fn remove(&self, device_id: &str) -> Result<(), StoreError> {
        {
            let mut map = self.records.write().unwrap();
            map.remove(device_id);
        }
        self.persist()
    }
}

fn load_records(path: &Path) -> Result<HashMap<String, DeviceRecord>, StoreError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    let records: HashMap<String, DeviceRecord> = serde_json::from_str(&data)?;
    debug!("loaded {} device(s) from {:?}", records.len(), path);
    Ok(records)
}

/// In-memory store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, DeviceRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceStore for MemoryStore {
    fn load_all(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        Ok(self.records.read().unwrap().values().cloned().collect())
    }

    fn upsert(&self, record: &DeviceRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .unwrap()
            .insert(record.device_id.clone(), record.clone());
        Ok(())
    }

    fn remove(&self, device_id: &str) -> Result<(), StoreError> {
        self.records.write().unwrap().remove(device_id);
        Ok(())
    }
}
