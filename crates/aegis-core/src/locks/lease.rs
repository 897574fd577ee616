//! Store-backed lease locks.
//!
//! Extends mutual exclusion across execution contexts that share only
//! a persistent store. A holder claims `_lock_{name}` with an expiring
//! lease record and verifies the claim survived any racing writer
//! before proceeding. Within one process a keyed mutex serializes
//! claimers outright; the lease narrows the cross-process race to a
//! single write-verify window and guarantees that a crashed holder
//! never wedges the lock past its expiry.

use crate::config::StorageKeys;
use crate::error::{AegisError, Result};
use crate::locks::local::LocalLockManager;
use crate::locks::traits::{LeaseCleanup, LockGuard, NamedLock};
use crate::storage::StorageArea;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Timing parameters for lease acquisition.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// How long a claimed lease stays valid without release.
    pub ttl: Duration,
    /// Delay between claim attempts while another holder is active.
    pub poll_interval: Duration,
    /// Give up acquiring after this long. Defaults to one full lease
    /// lifetime plus a poll, long enough to outwait a crashed holder.
    pub acquire_timeout: Duration,
}

impl LeaseConfig {
    pub const DEFAULT_TTL_SECS: u64 = 10;
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 25;

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self.acquire_timeout = ttl + self.poll_interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        let ttl = Duration::from_secs(Self::DEFAULT_TTL_SECS);
        let poll_interval = Duration::from_millis(Self::DEFAULT_POLL_INTERVAL_MS);
        Self {
            ttl,
            poll_interval,
            acquire_timeout: ttl + poll_interval,
        }
    }
}

/// Named lock backed by lease records in a shared storage area.
pub struct LeaseLock {
    area: Arc<dyn StorageArea>,
    local: LocalLockManager,
    config: LeaseConfig,
}

impl LeaseLock {
    pub fn new(area: Arc<dyn StorageArea>) -> Self {
        Self {
            area,
            local: LocalLockManager::new(),
            config: LeaseConfig::default(),
        }
    }

    pub fn with_config(mut self, config: LeaseConfig) -> Self {
        self.config = config;
        self
    }

    fn record_key(name: &str) -> String {
        format!("{}{}", StorageKeys::LEASE_PREFIX, name)
    }

    fn lease_expired(record: &Value) -> bool {
        let Some(expires_at) = record.get("expires_at").and_then(|v| v.as_str()) else {
            // Malformed records never block acquisition.
            return true;
        };
        match DateTime::parse_from_rfc3339(expires_at) {
            Ok(expires_at) => expires_at.with_timezone(&Utc) <= Utc::now(),
            Err(_) => true,
        }
    }

    async fn current_record(&self, key: &str) -> Result<Option<Value>> {
        let mut entries = self.area.get(&[key.to_string()]).await?;
        Ok(entries.remove(key))
    }

    async fn claim(&self, key: &str, holder: &str) -> Result<bool> {
        let expires_at = (Utc::now() + self.config.ttl).to_rfc3339();
        let record = json!({
            "holder": holder,
            "acquired_at": Utc::now().to_rfc3339(),
            "expires_at": expires_at,
        });
        let mut items = std::collections::HashMap::new();
        items.insert(key.to_string(), record);
        self.area.set(items).await?;

        // Settle, then verify the claim survived any concurrent writer.
        tokio::time::sleep(self.config.poll_interval / 2).await;
        let verified = self
            .current_record(key)
            .await?
            .as_ref()
            .and_then(|record| record.get("holder"))
            .and_then(|h| h.as_str())
            == Some(holder);
        Ok(verified)
    }
}

#[async_trait]
impl NamedLock for LeaseLock {
    async fn acquire(&self, name: &str) -> Result<LockGuard> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        let timed_out = || AegisError::Lock {
            name: name.to_string(),
            message: format!(
                "acquire timed out after {}ms",
                self.config.acquire_timeout.as_millis()
            ),
        };

        let slot = self.local.slot(name);
        let local_guard = tokio::time::timeout_at(deadline, slot.lock_owned())
            .await
            .map_err(|_| timed_out())?;

        let key = Self::record_key(name);
        let holder = Uuid::new_v4().to_string();
        loop {
            let claimable = match self.current_record(&key).await? {
                None => true,
                Some(record) => Self::lease_expired(&record),
            };

            if claimable && self.claim(&key, &holder).await? {
                debug!(name = %name, holder = %holder, "Lease acquired");
                return Ok(LockGuard::lease(
                    name,
                    local_guard,
                    LeaseCleanup {
                        area: Arc::clone(&self.area),
                        record_key: key,
                        holder,
                    },
                ));
            }

            if Instant::now() >= deadline {
                return Err(timed_out());
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}
