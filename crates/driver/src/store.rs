//! Persistent per-device key-value store
//!
//! The driver keeps a handful of typed values across restarts (how many
//! times the device was started, its serial number, restart counters).
//! [`FileStore`] persists them as a TOML table; [`MemoryStore`] is used
//! when no path is configured and in tests.

use crate::error::{DriverError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreKey {
    /// Number of successful device starts
    DeviceStamp,
    SerialNumber,
    ProtocolId,
    /// Number of full re-initializations after losing power
    SsrCounter,
    ParentDeviceName,
    Cid,
}

impl StoreKey {
    pub fn name(self) -> &'static str {
        match self {
            StoreKey::DeviceStamp => "device_stamp",
            StoreKey::SerialNumber => "serial_number",
            StoreKey::ProtocolId => "protocol_id",
            StoreKey::SsrCounter => "ssr_counter",
            StoreKey::ParentDeviceName => "parent_device_name",
            StoreKey::Cid => "cid",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoreValue {
    U32(u32),
    Text(String),
}

impl StoreValue {
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            StoreValue::U32(v) => Some(*v),
            StoreValue::Text(_) => None,
        }
    }
}

pub trait KeyValueStore: Send {
    fn get(&self, key: StoreKey) -> Result<Option<StoreValue>>;

    fn set(&mut self, key: StoreKey, value: StoreValue) -> Result<()>;

    /// Increment a counter, treating a missing or non-numeric value as 0
    fn increment(&mut self, key: StoreKey) -> Result<u32> {
        let next = self
            .get(key)?
            .and_then(|v| v.as_u32())
            .unwrap_or(0)
            .wrapping_add(1);
        self.set(key, StoreValue::U32(next))?;
        Ok(next)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: BTreeMap<StoreKey, StoreValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: StoreKey) -> Result<Option<StoreValue>> {
        Ok(self.values.get(&key).cloned())
    }

    fn set(&mut self, key: StoreKey, value: StoreValue) -> Result<()> {
        self.values.insert(key, value);
        Ok(())
    }
}

/// TOML-backed store, rewritten on every `set`
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: BTreeMap<String, StoreValue>,
}

impl FileStore {
    /// Open `path`, starting empty if it does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            let content = fs::read_to_string(&path)
                .map_err(|e| DriverError::Store(format!("{}: {}", path.display(), e)))?;
            toml::from_str(&content)
                .map_err(|e| DriverError::Store(format!("{}: {}", path.display(), e)))?
        } else {
            BTreeMap::new()
        };

        debug!("Opened store {} ({} values)", path.display(), values.len());
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<()> {
        let content = toml::to_string(&self.values)
            .map_err(|e| DriverError::Store(format!("serialize: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| DriverError::Store(format!("{}: {}", parent.display(), e)))?;
        }
        fs::write(&self.path, content)
            .map_err(|e| DriverError::Store(format!("{}: {}", self.path.display(), e)))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: StoreKey) -> Result<Option<StoreValue>> {
        Ok(self.values.get(key.name()).cloned())
    }

    fn set(&mut self, key: StoreKey, value: StoreValue) -> Result<()> {
        self.values.insert(key.name().to_string(), value);
        self.save()
    }
}
