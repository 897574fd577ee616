//! Quota-aware persistence.
//!
//! [`QuotaManager`] sits between callers and the raw storage areas and
//! keeps writes inside two budgets: a per-item budget and the area's
//! total capacity. Oversized records are shrunk in stages (field
//! projection, compaction, minimal-record fallback) and area pressure
//! is relieved by evicting low-value keys before a write ever reaches
//! the store. A write the store still rejects gets exactly one retry
//! with the minimized record; after that the failure is terminal.

use crate::config::StorageKeys;
use crate::error::{AegisError, Result};
use crate::storage::area::{AreaKind, StorageArea};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Budgets and shrink parameters for quota-managed writes.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Per-item budget in bytes.
    pub item_quota: u64,
    /// Total capacity of the local area in bytes.
    pub local_quota: u64,
    /// Total capacity of the sync area in bytes.
    pub sync_quota: u64,
    /// Fraction of each budget treated as the safe working limit.
    pub safety_buffer: f64,
    /// Strings longer than this are cut to a prefix during compaction.
    pub string_truncate_len: usize,
    /// Bounded history lists keep at most this many entries.
    pub history_keep: usize,
}

impl QuotaConfig {
    pub const DEFAULT_ITEM_QUOTA: u64 = 8 * 1024;
    pub const DEFAULT_SAFETY_BUFFER: f64 = 0.9;
    pub const DEFAULT_STRING_TRUNCATE_LEN: usize = 500;
    pub const DEFAULT_HISTORY_KEEP: usize = 50;

    pub fn with_item_quota(mut self, bytes: u64) -> Self {
        self.item_quota = bytes;
        self
    }

    pub fn with_area_quota(mut self, area: AreaKind, bytes: u64) -> Self {
        match area {
            AreaKind::Local => self.local_quota = bytes,
            AreaKind::Sync => self.sync_quota = bytes,
        }
        self
    }

    pub fn with_safety_buffer(mut self, buffer: f64) -> Self {
        self.safety_buffer = buffer;
        self
    }

    pub fn with_history_keep(mut self, entries: usize) -> Self {
        self.history_keep = entries;
        self
    }

    /// Total capacity of an area.
    pub fn area_quota(&self, area: AreaKind) -> u64 {
        match area {
            AreaKind::Local => self.local_quota,
            AreaKind::Sync => self.sync_quota,
        }
    }

    /// Per-item budget scaled by the safety buffer.
    pub fn item_budget(&self) -> u64 {
        (self.item_quota as f64 * self.safety_buffer) as u64
    }

    /// Area capacity scaled by the safety buffer.
    pub fn area_budget(&self, area: AreaKind) -> u64 {
        (self.area_quota(area) as f64 * self.safety_buffer) as u64
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            item_quota: Self::DEFAULT_ITEM_QUOTA,
            local_quota: AreaKind::Local.default_quota(),
            sync_quota: AreaKind::Sync.default_quota(),
            safety_buffer: Self::DEFAULT_SAFETY_BUFFER,
            string_truncate_len: Self::DEFAULT_STRING_TRUNCATE_LEN,
            history_keep: Self::DEFAULT_HISTORY_KEEP,
        }
    }
}

/// Per-write knobs for [`QuotaManager::store`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Run the compaction passes on oversized records.
    pub compress: bool,
    /// Evict low-value keys when the area is near capacity.
    pub cleanup_old: bool,
    /// Keep only these top-level fields before measuring size.
    pub essential_fields: Option<Vec<String>>,
    /// Override the per-item budget for this write.
    pub max_size: Option<u64>,
}

impl StoreOptions {
    pub fn with_essential_fields(mut self, fields: &[&str]) -> Self {
        self.essential_fields = Some(fields.iter().map(|s| s.to_string()).collect());
        self
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            compress: true,
            cleanup_old: true,
            essential_fields: None,
            max_size: None,
        }
    }
}

/// Snapshot of an area's usage, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub area: String,
    pub bytes_used: u64,
    pub quota_bytes: u64,
    pub percent_used: f64,
    pub item_count: usize,
    pub item_sizes: HashMap<String, u64>,
    pub largest_item: Option<LargestItem>,
}

/// The single biggest entry in an area.
#[derive(Debug, Clone, Serialize)]
pub struct LargestItem {
    pub key: String,
    pub size_bytes: u64,
}

/// Serialized length of a value in bytes.
fn serialized_len(value: &Value) -> u64 {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0) as u64
}

/// Cut a string to at most `max` characters, marking the cut.
fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Quota-enforcing writer over the two storage areas.
pub struct QuotaManager {
    local: Arc<dyn StorageArea>,
    sync: Arc<dyn StorageArea>,
    config: QuotaConfig,
    // Linearizes read-modify-write sequences so concurrent stores
    // against the same key cannot tear.
    write_gate: tokio::sync::Mutex<()>,
}

impl QuotaManager {
    pub fn new(local: Arc<dyn StorageArea>, sync: Arc<dyn StorageArea>) -> Self {
        Self {
            local,
            sync,
            config: QuotaConfig::default(),
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_config(mut self, config: QuotaConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Direct handle to the backing area, for reads that bypass the
    /// quota pipeline (state loads, diagnostics).
    pub fn area(&self, kind: AreaKind) -> &Arc<dyn StorageArea> {
        match kind {
            AreaKind::Local => &self.local,
            AreaKind::Sync => &self.sync,
        }
    }

    /// Store `data` under `key`, shrinking it as needed to fit the
    /// per-item budget and evicting to make room in the area.
    ///
    /// Returns the value actually written, which may be a projected,
    /// compacted, or minimal form of the input.
    pub async fn store(
        &self,
        key: &str,
        data: Value,
        area: AreaKind,
        options: StoreOptions,
    ) -> Result<Value> {
        let _gate = self.write_gate.lock().await;

        let max_size = options.max_size.unwrap_or_else(|| self.config.item_budget());
        let mut record = match &options.essential_fields {
            Some(fields) => project_fields(&data, fields),
            None => data,
        };

        let mut size = serialized_len(&record);
        if size > max_size {
            warn!(
                key = %key,
                size_bytes = size,
                max_bytes = max_size,
                "Record exceeds item budget, shrinking"
            );
            if options.compress {
                record = self.compact(record);
                size = serialized_len(&record);
            }
            if size > max_size {
                debug!(key = %key, "Compacted record still too large, reducing to minimal form");
                record = extract_minimal(&record);
            }
        }

        if options.cleanup_old {
            self.ensure_capacity(area, serialized_len(&record)).await?;
        }

        match self.write(area, key, &record).await {
            Ok(()) => Ok(record),
            Err(AegisError::QuotaExceeded { .. }) => {
                self.retry_minimized(area, key, &record).await
            }
            Err(e) => Err(e),
        }
    }

    /// Last resort after the store rejected a write: evict, minimize,
    /// and try exactly once more.
    async fn retry_minimized(&self, area: AreaKind, key: &str, record: &Value) -> Result<Value> {
        warn!(key = %key, area = %area, "Store rejected write at capacity, evicting and retrying minimized");
        self.evict(area).await?;

        let minimal = extract_minimal(record);
        let size = serialized_len(&minimal);
        if size > self.config.item_quota {
            return Err(AegisError::QuotaExceeded {
                size_bytes: size,
                limit_bytes: self.config.item_quota,
            });
        }

        self.write(area, key, &minimal).await?;
        Ok(minimal)
    }

    async fn write(&self, area: AreaKind, key: &str, record: &Value) -> Result<()> {
        let mut items = HashMap::new();
        items.insert(key.to_string(), record.clone());
        self.area(area).set(items).await
    }

    /// Append a record to the bounded analysis history list.
    ///
    /// The list keeps its newest `history_keep` entries and is further
    /// trimmed oldest-first until the whole list fits the per-item
    /// budget. Returns the resulting list length.
    pub async fn append_history(&self, record: Value) -> Result<usize> {
        let _gate = self.write_gate.lock().await;

        let key = StorageKeys::ANALYSIS_HISTORY.to_string();
        let area = self.area(AreaKind::Sync);

        let mut history = match area.get(&[key.clone()]).await?.remove(&key) {
            Some(Value::Array(entries)) => entries,
            _ => Vec::new(),
        };

        let mut record = record;
        if serialized_len(&record) > self.config.item_budget() {
            record = self.compact(record);
            if serialized_len(&record) > self.config.item_budget() {
                record = extract_minimal(&record);
            }
        }
        history.push(record);

        if history.len() > self.config.history_keep {
            let excess = history.len() - self.config.history_keep;
            history.drain(..excess);
        }
        self.trim_history_to_budget(&mut history);

        let len = history.len();
        let value = Value::Array(history);
        match self.write_history(&key, value.clone()).await {
            Ok(()) => Ok(len),
            Err(AegisError::QuotaExceeded { .. }) => {
                warn!("History write rejected at capacity, trimming harder and retrying");
                self.evict(AreaKind::Sync).await?;
                let mut entries = match value {
                    Value::Array(entries) => entries,
                    _ => Vec::new(),
                };
                while entries.len() > 1 {
                    entries.drain(..entries.len() / 2);
                    if self
                        .write_history(&key, Value::Array(entries.clone()))
                        .await
                        .is_ok()
                    {
                        return Ok(entries.len());
                    }
                }
                self.write_history(&key, Value::Array(entries.clone())).await?;
                Ok(entries.len())
            }
            Err(e) => Err(e),
        }
    }

    async fn write_history(&self, key: &str, value: Value) -> Result<()> {
        let mut items = HashMap::new();
        items.insert(key.to_string(), value);
        self.area(AreaKind::Sync).set(items).await
    }

    /// Drop oldest entries until the serialized list fits the item budget.
    fn trim_history_to_budget(&self, history: &mut Vec<Value>) {
        let budget = self.config.item_budget();
        let original = history.len();
        while !history.is_empty() && serialized_len(&Value::Array(history.clone())) > budget {
            history.remove(0);
        }
        if history.len() != original {
            warn!(
                original_entries = original,
                kept_entries = history.len(),
                "Trimmed history list to fit item budget"
            );
        }
    }

    /// Evict low-value keys if the pending write would push the area
    /// past its safe limit.
    async fn ensure_capacity(&self, area: AreaKind, required_bytes: u64) -> Result<()> {
        let usage = self.area(area).bytes_in_use(None).await?;
        let budget = self.config.area_budget(area);
        if usage + required_bytes > budget {
            warn!(
                area = %area,
                usage_bytes = usage,
                required_bytes = required_bytes,
                budget_bytes = budget,
                "Area near capacity, evicting"
            );
            self.evict(area).await?;
        }
        Ok(())
    }

    /// Free capacity: cap bounded history lists and drop ephemeral keys.
    async fn evict(&self, area: AreaKind) -> Result<()> {
        let store = self.area(area);
        let items = store.get_all().await?;

        if let Some(Value::Array(entries)) = items.get(StorageKeys::ANALYSIS_HISTORY) {
            if entries.len() > self.config.history_keep {
                let keep: Vec<Value> = entries
                    .iter()
                    .skip(entries.len() - self.config.history_keep)
                    .cloned()
                    .collect();
                debug!(
                    dropped = entries.len() - keep.len(),
                    "Capped history list during eviction"
                );
                let mut update = HashMap::new();
                update.insert(StorageKeys::ANALYSIS_HISTORY.to_string(), Value::Array(keep));
                store.set(update).await?;
            }
        }

        let ephemeral: Vec<String> = items
            .keys()
            .filter(|key| {
                StorageKeys::EPHEMERAL_PREFIXES
                    .iter()
                    .any(|prefix| key.starts_with(prefix))
            })
            .cloned()
            .collect();
        if !ephemeral.is_empty() {
            debug!(count = ephemeral.len(), "Removing ephemeral keys during eviction");
            store.remove(&ephemeral).await?;
        }

        Ok(())
    }

    /// Compaction passes for an oversized record: drop nulls, drop the
    /// known-large sub-objects, cut long top-level strings.
    fn compact(&self, record: Value) -> Value {
        let record = drop_nulls(record);
        let Value::Object(mut map) = record else {
            return record;
        };

        for field in ["metadata", "raw", "full_response"] {
            map.remove(field);
        }

        let limit = self.config.string_truncate_len;
        for value in map.values_mut() {
            if let Value::String(s) = value {
                if s.chars().count() > limit {
                    *value = Value::String(truncate_chars(s, limit));
                }
            }
        }

        Value::Object(map)
    }

    /// Usage snapshot for one area.
    pub async fn usage_stats(&self, area: AreaKind) -> Result<UsageStats> {
        let store = self.area(area);
        let bytes_used = store.bytes_in_use(None).await?;
        let items = store.get_all().await?;

        let item_sizes: HashMap<String, u64> = items
            .iter()
            .map(|(key, value)| (key.clone(), serialized_len(value)))
            .collect();
        let largest_item = item_sizes
            .iter()
            .max_by_key(|(_, size)| **size)
            .map(|(key, size)| LargestItem {
                key: key.clone(),
                size_bytes: *size,
            });

        let quota_bytes = self.config.area_quota(area);
        Ok(UsageStats {
            area: area.as_str().to_string(),
            bytes_used,
            quota_bytes,
            percent_used: if quota_bytes > 0 {
                bytes_used as f64 / quota_bytes as f64 * 100.0
            } else {
                0.0
            },
            item_count: items.len(),
            item_sizes,
            largest_item,
        })
    }
}

/// Keep only the named top-level fields of an object.
fn project_fields(data: &Value, fields: &[String]) -> Value {
    let Value::Object(map) = data else {
        return data.clone();
    };
    let mut out = Map::new();
    for field in fields {
        if let Some(value) = map.get(field) {
            out.insert(field.clone(), value.clone());
        }
    }
    Value::Object(out)
}

/// Recursively remove null fields from objects.
fn drop_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, drop_nulls(v)))
                .collect();
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(drop_nulls).collect()),
        other => other,
    }
}

/// Reduce a record to its highest-value fields.
fn extract_minimal(data: &Value) -> Value {
    let mut minimal = Map::new();

    let timestamp = data
        .get("timestamp")
        .cloned()
        .unwrap_or_else(|| json!(Utc::now().to_rfc3339()));
    minimal.insert("timestamp".to_string(), timestamp);

    if let Some(score) = data.get("score") {
        minimal.insert("score".to_string(), score.clone());
    }
    if let Some(analysis) = data.get("analysis") {
        for field in ["bias_score", "bias_type", "type"] {
            if let Some(value) = analysis.get(field) {
                minimal.insert(field.to_string(), value.clone());
            }
        }
    }
    if let Some(success) = data.get("success") {
        minimal.insert("success".to_string(), success.clone());
    }
    if let Some(error) = data.get("error") {
        if !error.is_null() {
            minimal.insert("error".to_string(), error.clone());
        }
    }

    Value::Object(minimal)
}
