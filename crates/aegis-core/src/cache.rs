//! Response caching with TTL expiry and in-flight request deduplication.
//!
//! Two cooperating pieces live here:
//! - [`ResponseCache`]: a TTL-keyed map of gateway responses. Expiry is lazy,
//!   resolved on every read by comparing timestamps; a periodic sweep exists
//!   only to reclaim memory and is never required for correctness.
//! - [`InflightRegistry`]: at most one pending execution per cache key.
//!   Concurrent callers for the same key share a single future, so N callers
//!   produce one network call and observe the same result or error.
//!
//! Cache keys are derived from the endpoint plus a canonical serialization of
//! the payload, so logically identical requests hash identically regardless
//! of object key order.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{AegisError, Result};

/// Configuration for the response cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Default time-to-live for inserted entries.
    pub ttl: Duration,
    /// Interval between background sweeps of expired entries.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Compute the cache key for a request.
///
/// The payload is canonicalized (object keys sorted recursively) before
/// hashing, so `{"a":1,"b":2}` and `{"b":2,"a":1}` produce the same key.
/// The hash only needs determinism and cache-grade collision resistance.
pub fn cache_key(endpoint: &str, payload: &Value) -> String {
    let canonical = canonical_json(payload);
    let digest = blake3::hash(canonical.as_bytes());
    let hex = hex::encode(digest.as_bytes());
    format!("{}:{}", endpoint, &hex[..16])
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> = map
                .iter()
                .map(|(k, v)| (k, canonical_json(v)))
                .collect();
            let inner: Vec<String> = sorted
                .iter()
                .map(|(k, v)| format!("{}:{}", serde_json::Value::from(k.as_str()), v))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

#[derive(Debug)]
struct CacheEntry {
    value: Arc<Value>,
    created_at: Instant,
    expires_at: Instant,
    last_accessed: Instant,
    size_bytes: u64,
}

/// Freshness of an entry at a given read instant.
enum Freshness {
    Fresh,
    Expired,
}

impl CacheEntry {
    fn freshness(&self, now: Instant) -> Freshness {
        if now < self.expires_at {
            Freshness::Fresh
        } else {
            Freshness::Expired
        }
    }
}

/// Cache statistics for operational visibility.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub active: usize,
    pub expired: usize,
    pub total_size_bytes: u64,
}

/// TTL-keyed response cache with lazy expiry.
#[derive(Debug)]
pub struct ResponseCache {
    config: CacheConfig,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up a fresh entry.
    ///
    /// An expired entry is evicted here and reported as absent; readers never
    /// observe stale data even if the sweeper has not run.
    pub fn get(&self, key: &str) -> Option<Arc<Value>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(key) {
            Some(entry) => match entry.freshness(now) {
                Freshness::Fresh => {
                    entry.last_accessed = now;
                    trace!(key, "cache hit");
                    Some(Arc::clone(&entry.value))
                }
                Freshness::Expired => {
                    entries.remove(key);
                    trace!(key, "cache entry expired on read");
                    None
                }
            },
            None => None,
        }
    }

    /// Insert with the default TTL.
    pub fn insert(&self, key: &str, value: Arc<Value>) {
        self.insert_with_ttl(key, value, self.config.ttl);
    }

    /// Insert with an explicit TTL, overwriting any previous entry.
    pub fn insert_with_ttl(&self, key: &str, value: Arc<Value>, ttl: Duration) {
        let now = Instant::now();
        let size_bytes = serde_json::to_string(value.as_ref())
            .map(|s| s.len() as u64)
            .unwrap_or(0);
        let entry = CacheEntry {
            value,
            created_at: now,
            expires_at: now + ttl,
            last_accessed: now,
            size_bytes,
        };
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), entry);
    }

    /// Remove one entry. Returns whether it existed.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(key).is_some()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap();
        entries.clear();
    }

    /// Remove expired entries, returning how many were dropped.
    ///
    /// Memory reclamation only; reads are already correct without it.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| matches!(entry.freshness(now), Freshness::Fresh));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "cache sweep removed expired entries");
        }
        removed
    }

    /// Snapshot entry counts and sizes without mutating the cache.
    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap();
        let mut stats = CacheStats {
            entries: entries.len(),
            ..Default::default()
        };
        for entry in entries.values() {
            stats.total_size_bytes += entry.size_bytes;
            match entry.freshness(now) {
                Freshness::Fresh => stats.active += 1,
                Freshness::Expired => stats.expired += 1,
            }
        }
        stats
    }

    /// Age of the oldest entry, if any. Diagnostic only.
    pub fn oldest_entry_age(&self) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap();
        entries
            .values()
            .map(|e| now.duration_since(e.created_at))
            .max()
    }

    /// Start the periodic sweep task.
    ///
    /// The returned handle should be aborted on teardown; the sweeper holds a
    /// clone of the cache and would otherwise run for the process lifetime.
    pub fn spawn_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = self;
        let interval = cache.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so the sweep cadence
            // starts one full interval after startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.sweep();
            }
        })
    }
}

type SharedOutcome = std::result::Result<Arc<Value>, Arc<AegisError>>;
type SharedExecution = Shared<BoxFuture<'static, SharedOutcome>>;

/// Registry of in-flight executions keyed by cache key.
///
/// The first caller for a key becomes the leader and drives the operation;
/// later callers join the leader's shared future and never start their own.
/// The slot is removed when the execution settles, success or failure.
#[derive(Default)]
pub struct InflightRegistry {
    pending: Mutex<HashMap<String, (u64, SharedExecution)>>,
    generation: AtomicU64,
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an execution for this key is currently pending.
    pub fn is_in_flight(&self, key: &str) -> bool {
        let pending = self.pending.lock().unwrap();
        pending.contains_key(key)
    }

    /// Number of pending executions.
    pub fn in_flight(&self) -> usize {
        let pending = self.pending.lock().unwrap();
        pending.len()
    }

    /// Run `operation` for `key`, or join an execution already in flight.
    ///
    /// The operation future is only polled by the leading caller; joiners drop
    /// theirs unexecuted. Every caller observes the same settled outcome.
    pub async fn execute_or_join<F>(&self, key: &str, operation: F) -> Result<Arc<Value>>
    where
        F: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        let (generation, shared, leading) = {
            let mut pending = self.pending.lock().unwrap();
            if let Some((generation, shared)) = pending.get(key) {
                trace!(key, "joining in-flight request");
                (*generation, shared.clone(), false)
            } else {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let shared: SharedExecution = async move {
                    operation.await.map(Arc::new).map_err(Arc::new)
                }
                .boxed()
                .shared();
                pending.insert(key.to_string(), (generation, shared.clone()));
                (generation, shared, true)
            }
        };

        let outcome = shared.await;

        // Whichever awaiter finishes first clears the slot; the generation
        // check keeps a newer execution under the same key from being removed.
        {
            let mut pending = self.pending.lock().unwrap();
            if let Some((current, _)) = pending.get(key) {
                if *current == generation {
                    pending.remove(key);
                }
            }
        }

        if leading {
            trace!(key, "in-flight request settled");
        }

        outcome.map_err(|e| e.shallow_clone())
    }
}
