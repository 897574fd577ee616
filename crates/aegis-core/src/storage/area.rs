//! Key-value storage areas.
//!
//! A [`StorageArea`] models a quota-bounded key-value store holding JSON
//! values. Two areas exist: a roomy local area and a small synchronized
//! area. All sizes are measured the same way the quota accounting does:
//! key length plus serialized value length in bytes.

use crate::error::{AegisError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

/// Which storage area a key lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AreaKind {
    /// Device-local storage. Roomy, never leaves the machine.
    Local,
    /// Synchronized storage. Small, replicated across devices.
    Sync,
}

impl AreaKind {
    /// All storage areas.
    pub const ALL: [AreaKind; 2] = [AreaKind::Local, AreaKind::Sync];

    pub fn as_str(&self) -> &'static str {
        match self {
            AreaKind::Local => "local",
            AreaKind::Sync => "sync",
        }
    }

    /// Total capacity of the area in bytes.
    pub fn default_quota(&self) -> u64 {
        match self {
            AreaKind::Local => 10 * 1024 * 1024,
            AreaKind::Sync => 1024 * 1024,
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "local" => Some(AreaKind::Local),
            "sync" => Some(AreaKind::Sync),
            _ => None,
        }
    }
}

impl fmt::Display for AreaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Size of a single entry as counted against quotas.
///
/// Matches the accounting used by `bytes_in_use`: the key's UTF-8 length
/// plus the length of the value serialized as compact JSON.
pub fn entry_size(key: &str, value: &Value) -> u64 {
    let value_len = serde_json::to_string(value).map(|s| s.len()).unwrap_or(0);
    (key.len() + value_len) as u64
}

/// Asynchronous key-value storage backend.
///
/// Implementations must make each method atomic with respect to the
/// others; callers layer read-modify-write sequences on top via named
/// locks when they need them to be.
#[async_trait]
pub trait StorageArea: Send + Sync {
    /// Fetch the values for `keys`. Missing keys are absent from the map.
    async fn get(&self, keys: &[String]) -> Result<HashMap<String, Value>>;

    /// Fetch every entry in the area.
    async fn get_all(&self) -> Result<HashMap<String, Value>>;

    /// Write all entries in `items`, replacing existing values.
    async fn set(&self, items: HashMap<String, Value>) -> Result<()>;

    /// Delete `keys`. Deleting an absent key is not an error.
    async fn remove(&self, keys: &[String]) -> Result<()>;

    /// Bytes consumed by `keys`, or by the whole area when `None`.
    async fn bytes_in_use(&self, keys: Option<&[String]>) -> Result<u64>;
}

/// In-memory storage area.
///
/// The primary backend for tests. An optional hard capacity makes it
/// reject writes the way a real quota-bounded store does, which lets
/// callers exercise their over-capacity handling.
pub struct MemoryArea {
    entries: Mutex<HashMap<String, Value>>,
    capacity: Option<u64>,
}

impl MemoryArea {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: None,
        }
    }

    /// Reject any `set` that would push total usage past `bytes`.
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(bytes);
        self
    }

    fn usage_of(entries: &HashMap<String, Value>) -> u64 {
        entries.iter().map(|(k, v)| entry_size(k, v)).sum()
    }
}

impl Default for MemoryArea {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageArea for MemoryArea {
    async fn get(&self, keys: &[String]) -> Result<HashMap<String, Value>> {
        let entries = self.entries.lock().unwrap();
        let mut out = HashMap::new();
        for key in keys {
            if let Some(value) = entries.get(key) {
                out.insert(key.clone(), value.clone());
            }
        }
        Ok(out)
    }

    async fn get_all(&self) -> Result<HashMap<String, Value>> {
        Ok(self.entries.lock().unwrap().clone())
    }

    async fn set(&self, items: HashMap<String, Value>) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(capacity) = self.capacity {
            let mut projected = entries.clone();
            for (key, value) in &items {
                projected.insert(key.clone(), value.clone());
            }
            let usage = Self::usage_of(&projected);
            if usage > capacity {
                return Err(AegisError::QuotaExceeded {
                    size_bytes: usage,
                    limit_bytes: capacity,
                });
            }
        }
        for (key, value) in items {
            entries.insert(key, value);
        }
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn bytes_in_use(&self, keys: Option<&[String]>) -> Result<u64> {
        let entries = self.entries.lock().unwrap();
        let total = match keys {
            Some(keys) => keys
                .iter()
                .filter_map(|k| entries.get(k).map(|v| entry_size(k, v)))
                .sum(),
            None => Self::usage_of(&entries),
        };
        Ok(total)
    }
}
