//! Station and device status records
//!
//! The poller records what it did against each station (last contact,
//! last message, last error) and, for shared device farms, which process
//! holds each port. Storage is behind `StatusStore`; two stores ship here:
//! - `MemoryStatusStore` for single-process runs and tests
//! - `JsonFileStatusStore`, a write-through JSON file shared between runs

use crate::error::{PollError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Record for one pooled device port (`<host>:<n>`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceStatus {
    pub device_name: String,
    pub in_use: bool,
    pub last_used_by_proc: Option<String>,
    pub last_used_by_host: Option<String>,
    pub last_activity_time: Option<DateTime<Utc>>,
    pub last_receive_time: Option<DateTime<Utc>>,
    pub last_error_time: Option<DateTime<Utc>>,
    /// Free-text state, e.g. `Dialing 5551234`
    pub port_status: String,
    /// Medium id of the station last served
    pub media_id: Option<String>,
}

impl DeviceStatus {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            ..Default::default()
        }
    }
}

/// Record for one station, keyed by `StationTarget::status_key`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformStatus {
    pub key: String,
    pub last_contact_time: Option<DateTime<Utc>>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub annotation: Option<String>,
}

impl PlatformStatus {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }
}

/// Persistence for status records
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn read_device(&self, name: &str) -> Result<Option<DeviceStatus>>;
    async fn write_device(&self, status: &DeviceStatus) -> Result<()>;
    async fn read_platform(&self, key: &str) -> Result<Option<PlatformStatus>>;
    async fn write_platform(&self, status: &PlatformStatus) -> Result<()>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct Records {
    devices: HashMap<String, DeviceStatus>,
    platforms: HashMap<String, PlatformStatus>,
}

// =============================================================================
// In-memory store
// =============================================================================

#[derive(Default)]
pub struct MemoryStatusStore {
    records: Mutex<Records>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn StatusStore> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn read_device(&self, name: &str) -> Result<Option<DeviceStatus>> {
        Ok(self.records.lock().devices.get(name).cloned())
    }

    async fn write_device(&self, status: &DeviceStatus) -> Result<()> {
        self.records
            .lock()
            .devices
            .insert(status.device_name.clone(), status.clone());
        Ok(())
    }

    async fn read_platform(&self, key: &str) -> Result<Option<PlatformStatus>> {
        Ok(self.records.lock().platforms.get(key).cloned())
    }

    async fn write_platform(&self, status: &PlatformStatus) -> Result<()> {
        self.records
            .lock()
            .platforms
            .insert(status.key.clone(), status.clone());
        Ok(())
    }
}

// =============================================================================
// JSON file store
// =============================================================================

/// Status records kept in memory and rewritten to a JSON file on every change
///
/// The file is replaced atomically (write temp file, rename).
pub struct JsonFileStatusStore {
    path: PathBuf,
    records: tokio::sync::Mutex<Records>,
}

impl JsonFileStatusStore {
    /// Load `path` if it exists, otherwise start empty
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => Records::default(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| PollError::Status {
                message: format!("{}: {}", path.display(), e),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Records::default(),
            Err(e) => return Err(PollError::Io { path, source: e }),
        };
        Ok(Self {
            path,
            records: tokio::sync::Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, records: &Records) -> Result<()> {
        let json = serde_json::to_vec_pretty(records).map_err(|e| PollError::Status {
            message: e.to_string(),
        })?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| PollError::Io {
                path: tmp.clone(),
                source: e,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| PollError::Io {
                path: self.path.clone(),
                source: e,
            })
    }
}

#[async_trait]
impl StatusStore for JsonFileStatusStore {
    async fn read_device(&self, name: &str) -> Result<Option<DeviceStatus>> {
        Ok(self.records.lock().await.devices.get(name).cloned())
    }

    async fn write_device(&self, status: &DeviceStatus) -> Result<()> {
        let mut records = self.records.lock().await;
        records
            .devices
            .insert(status.device_name.clone(), status.clone());
        self.persist(&records).await
    }

    async fn read_platform(&self, key: &str) -> Result<Option<PlatformStatus>> {
        Ok(self.records.lock().await.platforms.get(key).cloned())
    }

    async fn write_platform(&self, status: &PlatformStatus) -> Result<()> {
        let mut records = self.records.lock().await;
        records.platforms.insert(status.key.clone(), status.clone());
        self.persist(&records).await
    }
}

/// Store selected by `status_file`: JSON file when set, memory otherwise
pub async fn open_store(status_file: Option<&Path>) -> Result<Arc<dyn StatusStore>> {
    match status_file {
        Some(path) => Ok(Arc::new(JsonFileStatusStore::open(path).await?)),
        None => Ok(MemoryStatusStore::shared()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStatusStore::new();
        assert!(store.read_device("farm:1").await.unwrap().is_none());

        let mut dev = DeviceStatus::new("farm:1");
        dev.in_use = true;
        dev.last_used_by_proc = Some("dcp-poll".into());
        store.write_device(&dev).await.unwrap();

        assert_eq!(store.read_device("farm:1").await.unwrap(), Some(dev));
    }

    #[tokio::test]
    async fn test_json_store_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");

        {
            let store = JsonFileStatusStore::open(&path).await.unwrap();
            let mut ps = PlatformStatus::new("BIGRIVER:5551234");
            ps.last_message_time = Some(Utc::now());
            ps.annotation = Some("ok".into());
            store.write_platform(&ps).await.unwrap();
        }

        let store = JsonFileStatusStore::open(&path).await.unwrap();
        let ps = store
            .read_platform("BIGRIVER:5551234")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ps.annotation.as_deref(), Some("ok"));
        assert!(ps.last_message_time.is_some());
    }

    #[tokio::test]
    async fn test_json_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            JsonFileStatusStore::open(&path).await,
            Err(PollError::Status { .. })
        ));
    }
}
