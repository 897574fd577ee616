//! Resilient gateway client.
//!
//! [`ResilientClient`] is the single entry point for talking to the analysis
//! gateway. Every outbound request passes through the same pipeline:
//!
//! 1. Request validation (shape and size rules per endpoint)
//! 2. Response cache lookup
//! 3. In-flight deduplication, so concurrent identical requests share one
//!    network call
//! 4. Sliding-window rate limiting per endpoint category
//! 5. Circuit breaker with a per-call timeout
//! 6. Credential attachment, refreshing under a named lock when needed
//!
//! The client also owns the guard-service registry, trace counters, and the
//! quota-managed persistence of analysis history and configuration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::TokenGate;
use crate::cache::{cache_key, CacheConfig, CacheStats, InflightRegistry, ResponseCache};
use crate::config::{Endpoint, GatewayConfig, GuardService, RateCategory, StorageKeys};
use crate::error::{AegisError, Result};
use crate::models::{
    AnalyzeOptions, CentralConfig, CentralConfigUpdate, GuardState, GuardStatusReport,
    GuardSummary, GuardUpdate, LogEntry, TraceStats,
};
use crate::network::{
    generate_id, BreakerConfig, CircuitBreaker, CircuitBreakerStats, GatewayTransport,
};
use crate::ratelimit::SlidingWindowLimiter;
use crate::sanitize::{clean_for_logging, sanitize_text};
use crate::storage::{AreaKind, QuotaManager, StoreOptions, UsageStats};

/// Rate-limit bucket shared by all calls from this client instance.
const RATE_SCOPE: &str = "default";

/// Client-level configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Gateway base URL, reported in configuration snapshots.
    pub base_url: String,
    /// Pipeline identifier sent with every analysis request.
    pub analysis_pipeline: String,
    /// Free-form logging configuration forwarded to coordinators.
    pub logging_config: Value,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: GatewayConfig::DEFAULT_BASE_URL.to_string(),
            analysis_pipeline: "default".to_string(),
            logging_config: json!({}),
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_analysis_pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.analysis_pipeline = pipeline.into();
        self
    }
}

/// Request counters kept for diagnostics.
///
/// Rate-limit denials are tallied in `error_counts` without inflating the
/// request count; they never became requests.
#[derive(Debug, Default)]
struct TraceRecorder {
    requests: u64,
    successes: u64,
    failures: u64,
    total_response_time_ms: u64,
    last_request_time: Option<String>,
    error_counts: HashMap<String, u64>,
}

impl TraceRecorder {
    fn begin_request(&mut self) {
        self.requests += 1;
        self.last_request_time = Some(Utc::now().to_rfc3339());
    }

    fn record_success(&mut self, elapsed_ms: u64) {
        self.successes += 1;
        self.total_response_time_ms += elapsed_ms;
    }

    fn record_failure(&mut self, kind: &str) {
        self.failures += 1;
        *self.error_counts.entry(kind.to_string()).or_insert(0) += 1;
    }

    fn record_denial(&mut self, kind: &str) {
        *self.error_counts.entry(kind.to_string()).or_insert(0) += 1;
    }

    fn snapshot(&self) -> TraceStats {
        let (average, success_rate, failure_rate) = if self.requests == 0 {
            (0.0, 0.0, 0.0)
        } else {
            let requests = self.requests as f64;
            (
                self.total_response_time_ms as f64 / requests,
                self.successes as f64 / requests * 100.0,
                self.failures as f64 / requests * 100.0,
            )
        };
        TraceStats {
            requests: self.requests,
            successes: self.successes,
            failures: self.failures,
            total_response_time_ms: self.total_response_time_ms,
            average_response_time_ms: average,
            last_request_time: self.last_request_time.clone(),
            error_counts: self.error_counts.clone(),
            success_rate,
            failure_rate,
        }
    }
}

/// Configured limit and current headroom for one rate category.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub max_requests: u32,
    pub window_secs: u64,
    pub remaining: u32,
}

/// Storage usage for both areas.
#[derive(Debug, Clone, Serialize)]
pub struct StorageReport {
    pub local: UsageStats,
    pub sync: UsageStats,
}

/// Configuration values included in a diagnostics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigReport {
    pub base_url: String,
    pub analysis_pipeline: String,
    pub client_version: String,
}

/// Point-in-time view of every protective layer, for operators.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub instance_id: String,
    pub generated_at: String,
    pub uptime_secs: u64,
    pub trace: TraceStats,
    pub circuit_breaker: CircuitBreakerStats,
    pub cache: CacheStats,
    pub rate_limits: HashMap<String, RateLimitSnapshot>,
    pub guard_services: HashMap<String, GuardSummary>,
    pub storage: StorageReport,
    pub configuration: ConfigReport,
}

/// Gateway client wiring cache, dedup, rate limits, circuit breaking,
/// credentials, and quota-managed persistence into one request path.
pub struct ResilientClient {
    transport: Arc<dyn GatewayTransport>,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<ResponseCache>,
    inflight: InflightRegistry,
    limiter: Arc<SlidingWindowLimiter>,
    quota: Arc<QuotaManager>,
    tokens: Arc<TokenGate>,
    guards: RwLock<HashMap<String, GuardState>>,
    trace: Arc<Mutex<TraceRecorder>>,
    config: RwLock<ClientConfig>,
    instance_id: String,
    started_at: Instant,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ResilientClient {
    pub fn new(
        transport: Arc<dyn GatewayTransport>,
        quota: Arc<QuotaManager>,
        tokens: TokenGate,
    ) -> Self {
        let guards = GuardService::ALL
            .iter()
            .map(|service| {
                (
                    service.as_str().to_string(),
                    GuardState::defaults_for(*service),
                )
            })
            .collect();

        Self {
            transport,
            breaker: Arc::new(CircuitBreaker::new("gateway")),
            cache: Arc::new(ResponseCache::new(CacheConfig::default())),
            inflight: InflightRegistry::new(),
            limiter: Arc::new(SlidingWindowLimiter::new()),
            quota,
            tokens: Arc::new(tokens),
            guards: RwLock::new(guards),
            trace: Arc::new(Mutex::new(TraceRecorder::default())),
            config: RwLock::new(ClientConfig::default()),
            instance_id: generate_id("client"),
            started_at: Instant::now(),
            sweeper: Mutex::new(None),
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = RwLock::new(config);
        self
    }

    pub fn with_breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker = Arc::new(CircuitBreaker::with_config("gateway", config));
        self
    }

    pub fn with_cache_config(mut self, config: CacheConfig) -> Self {
        self.cache = Arc::new(ResponseCache::new(config));
        self
    }

    pub fn with_rate_limiter(mut self, limiter: SlidingWindowLimiter) -> Self {
        self.limiter = Arc::new(limiter);
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Restore guard states and central configuration persisted by an
    /// earlier instance. Malformed stored values are logged and skipped.
    pub async fn load_state(&self) -> Result<()> {
        let keys = [
            StorageKeys::GUARD_SETTINGS.to_string(),
            StorageKeys::CENTRAL_CONFIG.to_string(),
        ];
        let stored = self.quota.area(AreaKind::Sync).get(&keys).await?;

        if let Some(value) = stored.get(StorageKeys::GUARD_SETTINGS) {
            match serde_json::from_value::<HashMap<String, GuardState>>(value.clone()) {
                Ok(saved) => {
                    let mut guards = self.guards.write().unwrap();
                    for (name, state) in saved {
                        // Only known services are restored; stale entries
                        // from removed services are ignored.
                        if guards.contains_key(&name) {
                            guards.insert(name, state);
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed stored guard settings");
                }
            }
        }

        if let Some(value) = stored.get(StorageKeys::CENTRAL_CONFIG) {
            let mut config = self.config.write().unwrap();
            if let Some(url) = value.get("gateway_url").and_then(Value::as_str) {
                config.base_url = url.to_string();
            }
            if let Some(pipeline) = value.get("analysis_pipeline").and_then(Value::as_str) {
                config.analysis_pipeline = pipeline.to_string();
            }
            if let Some(logging) = value.get("logging_config") {
                if !logging.is_null() {
                    config.logging_config = logging.clone();
                }
            }
        }

        info!("Client state restored from storage");
        Ok(())
    }

    /// Analyze `text` with every enabled guard service.
    ///
    /// The text is sanitized and cut to the gateway's maximum length before
    /// anything else sees it. Identical concurrent requests share a single
    /// network call, and recent results are served from cache.
    pub async fn analyze_text(&self, text: &str, options: AnalyzeOptions) -> Result<Arc<Value>> {
        let sanitized = sanitize_text(text, GatewayConfig::MAX_TEXT_LENGTH);
        if sanitized.trim().is_empty() {
            return Err(AegisError::Validation {
                field: "text".to_string(),
                message: "analysis text must not be empty".to_string(),
            });
        }

        let mut guard_names: Vec<String> = {
            let guards = self.guards.read().unwrap();
            guards
                .iter()
                .filter(|(_, state)| state.enabled)
                .map(|(name, _)| name.clone())
                .collect()
        };
        // Sorted so identical requests produce identical payloads.
        guard_names.sort();
        if guard_names.is_empty() {
            return Err(AegisError::Validation {
                field: "guards".to_string(),
                message: "no guard services are enabled".to_string(),
            });
        }

        let pipeline = self.config.read().unwrap().analysis_pipeline.clone();
        let analysis_id = generate_id("analysis");

        let mut options_map = match serde_json::to_value(&options)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        options_map.insert("pipeline".to_string(), json!(pipeline));

        // The cache and dedup key is derived before the volatile fields go
        // in, so repeated requests for the same text coalesce.
        let basis = json!({
            "text": sanitized.clone(),
            "guards": guard_names.clone(),
            "options": Value::Object(options_map.clone()),
        });

        options_map.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));
        let payload = json!({
            "analysis_id": analysis_id.clone(),
            "text": sanitized.clone(),
            "guards": guard_names.clone(),
            "options": Value::Object(options_map),
        });

        info!(
            analysis_id = %analysis_id,
            guards = guard_names.len(),
            chars = sanitized.chars().count(),
            "Submitting text for analysis"
        );

        match self.send(Endpoint::Analyze, payload, Some(&basis)).await {
            Ok(response) => {
                self.mark_guard_outcome(&guard_names, true);
                self.record_history(&analysis_id, &sanitized, &response).await;
                Ok(response)
            }
            Err(e) => {
                self.mark_guard_outcome(&guard_names, false);
                Err(e)
            }
        }
    }

    /// Probe the gateway health endpoint.
    ///
    /// Never cached; a liveness answer served from cache would mask an
    /// outage. The breaker and rate limiter still apply.
    pub async fn health_check(&self) -> Result<Arc<Value>> {
        self.send(Endpoint::Health, json!({"test": true}), None).await
    }

    /// Whether the gateway currently answers health checks.
    pub async fn test_connection(&self) -> bool {
        match self.health_check().await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Gateway connection test failed");
                false
            }
        }
    }

    /// Status of every guard service plus gateway reachability.
    pub async fn guard_status(&self) -> GuardStatusReport {
        let gateway_connected = self.test_connection().await;
        let guard_services: HashMap<String, GuardSummary> = {
            let guards = self.guards.read().unwrap();
            guards
                .iter()
                .map(|(name, state)| (name.clone(), GuardSummary::from(state)))
                .collect()
        };
        let trace = self.trace.lock().unwrap().snapshot();
        GuardStatusReport {
            gateway_connected,
            guard_services,
            total_requests: trace.requests,
            success_rate: trace.success_rate,
        }
    }

    /// Apply a partial update to one guard service and persist the result.
    pub async fn update_guard_service(&self, name: &str, update: GuardUpdate) -> Result<GuardState> {
        let (updated, snapshot) = {
            let mut guards = self.guards.write().unwrap();
            let state = guards.get_mut(name).ok_or_else(|| AegisError::Validation {
                field: "service".to_string(),
                message: format!("unknown guard service: {}", name),
            })?;
            update.apply(state);
            (state.clone(), guards.clone())
        };

        self.persist_guards(&snapshot).await?;
        info!(service = name, enabled = updated.enabled, "Guard service updated");
        Ok(updated)
    }

    /// Current deployment-wide configuration, assembled locally.
    pub async fn central_config(&self) -> Result<CentralConfig> {
        let api_key_configured = self
            .tokens
            .current()
            .await?
            .map(|token| !token.is_empty())
            .unwrap_or(false);

        let (gateway_url, logging_config, analysis_pipeline) = {
            let config = self.config.read().unwrap();
            (
                config.base_url.clone(),
                config.logging_config.clone(),
                config.analysis_pipeline.clone(),
            )
        };
        let guard_services = self.guards.read().unwrap().clone();

        Ok(CentralConfig {
            gateway_url,
            api_key_configured,
            guard_services,
            logging_config,
            analysis_pipeline,
        })
    }

    /// Apply a partial configuration update and persist it.
    ///
    /// A changed gateway URL takes effect for transports constructed after
    /// the update; the live transport keeps its configured base.
    pub async fn update_central_config(
        &self,
        update: CentralConfigUpdate,
    ) -> Result<CentralConfig> {
        if let Some(url) = &update.gateway_url {
            Url::parse(url).map_err(|e| AegisError::Validation {
                field: "gateway_url".to_string(),
                message: format!("invalid gateway URL: {}", e),
            })?;
        }

        let record = {
            let mut config = self.config.write().unwrap();
            if let Some(url) = &update.gateway_url {
                config.base_url = url.clone();
            }
            if let Some(logging) = &update.logging_config {
                config.logging_config = logging.clone();
            }
            if let Some(pipeline) = &update.analysis_pipeline {
                config.analysis_pipeline = pipeline.clone();
            }

            let mut record = Map::new();
            record.insert("gateway_url".to_string(), json!(config.base_url));
            record.insert("logging_config".to_string(), config.logging_config.clone());
            record.insert(
                "analysis_pipeline".to_string(),
                json!(config.analysis_pipeline),
            );
            record.insert("updated_at".to_string(), json!(Utc::now().to_rfc3339()));
            if let Some(api_key) = &update.api_key {
                record.insert("api_key".to_string(), json!(api_key));
            }
            Value::Object(record)
        };

        self.quota
            .store(
                StorageKeys::CENTRAL_CONFIG,
                record,
                AreaKind::Sync,
                StoreOptions::default(),
            )
            .await?;

        info!("Central configuration updated");
        self.central_config().await
    }

    /// Submit a batch of log entries in a single request.
    ///
    /// Entries are validated, their metadata cleaned of sensitive fields,
    /// and stamped with a timestamp and client version. Returns the number
    /// of entries submitted.
    pub async fn submit_log_batch(&self, entries: Vec<LogEntry>) -> Result<u64> {
        if entries.is_empty() {
            return Err(AegisError::Validation {
                field: "entries".to_string(),
                message: "log batch is empty".to_string(),
            });
        }

        let now = Utc::now().to_rfc3339();
        let mut batch = Vec::with_capacity(entries.len());
        for entry in &entries {
            if entry.level.trim().is_empty() || entry.message.trim().is_empty() {
                return Err(AegisError::Validation {
                    field: "entries".to_string(),
                    message: "log entries require a level and a message".to_string(),
                });
            }
            let mut metadata = match &entry.metadata {
                Some(metadata) => clean_for_logging(metadata),
                None => json!({}),
            };
            if let Value::Object(map) = &mut metadata {
                map.entry("timestamp")
                    .or_insert_with(|| Value::String(now.clone()));
                map.insert(
                    "client_version".to_string(),
                    json!(GatewayConfig::CLIENT_VERSION),
                );
            }
            batch.push(json!({
                "level": entry.level.clone(),
                "message": entry.message.clone(),
                "metadata": metadata,
            }));
        }

        let submitted = batch.len() as u64;
        let payload = json!({"entries": batch});
        self.send(Endpoint::Logging, payload, None).await?;
        debug!(entries = submitted, "Log batch submitted");
        Ok(submitted)
    }

    /// Snapshot of the request counters.
    pub fn stats(&self) -> TraceStats {
        self.trace.lock().unwrap().snapshot()
    }

    /// Full diagnostics across every protective layer.
    pub async fn diagnostics(&self) -> Result<Diagnostics> {
        let local = self.quota.usage_stats(AreaKind::Local).await?;
        let sync = self.quota.usage_stats(AreaKind::Sync).await?;

        let mut rate_limits = HashMap::new();
        for category in RateCategory::ALL {
            let (max_requests, window) = self.limiter.limit(category);
            rate_limits.insert(
                category.as_str().to_string(),
                RateLimitSnapshot {
                    max_requests,
                    window_secs: window.as_secs(),
                    remaining: self.limiter.remaining(category, RATE_SCOPE),
                },
            );
        }

        let guard_services = {
            let guards = self.guards.read().unwrap();
            guards
                .iter()
                .map(|(name, state)| (name.clone(), GuardSummary::from(state)))
                .collect()
        };

        let configuration = {
            let config = self.config.read().unwrap();
            ConfigReport {
                base_url: config.base_url.clone(),
                analysis_pipeline: config.analysis_pipeline.clone(),
                client_version: GatewayConfig::CLIENT_VERSION.to_string(),
            }
        };

        Ok(Diagnostics {
            instance_id: self.instance_id.clone(),
            generated_at: Utc::now().to_rfc3339(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            trace: self.stats(),
            circuit_breaker: self.breaker.stats(),
            cache: self.cache.stats(),
            rate_limits,
            guard_services,
            storage: StorageReport { local, sync },
            configuration,
        })
    }

    /// Start the background cache sweeper. Calling again while it runs is
    /// a no-op.
    pub fn start_sweeper(&self) {
        let mut slot = self.sweeper.lock().unwrap();
        if slot.is_some() {
            return;
        }
        *slot = Some(Arc::clone(&self.cache).spawn_sweeper());
    }

    /// Stop background work. Safe to call more than once.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
            debug!("Cache sweeper stopped");
        }
    }

    // Internal methods

    /// Shared request pipeline.
    ///
    /// `cache_basis` carries the stable view of the request used for cache
    /// and dedup keys. `None` bypasses both, for requests whose side
    /// effects must not coalesce.
    async fn send(
        &self,
        endpoint: Endpoint,
        payload: Value,
        cache_basis: Option<&Value>,
    ) -> Result<Arc<Value>> {
        validate_request(endpoint, &payload)?;

        let key = cache_basis.map(|basis| cache_key(endpoint.as_str(), basis));
        if let Some(key) = &key {
            if let Some(hit) = self.cache.get(key) {
                debug!(endpoint = endpoint.as_str(), "Serving cached response");
                return Ok(hit);
            }
        }

        let transport = Arc::clone(&self.transport);
        let breaker = Arc::clone(&self.breaker);
        let limiter = Arc::clone(&self.limiter);
        let tokens = Arc::clone(&self.tokens);
        let trace = Arc::clone(&self.trace);
        let cache_slot = key
            .as_ref()
            .map(|key| (Arc::clone(&self.cache), key.clone()));

        let operation = async move {
            let category = endpoint.rate_category();
            if !limiter.is_allowed(category, RATE_SCOPE) {
                let wait = limiter.retry_after(category, RATE_SCOPE);
                let retry_after_secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
                trace.lock().unwrap().record_denial("rate_limited");
                warn!(
                    category = category.as_str(),
                    retry_after_secs, "Rate limit exceeded, rejecting request"
                );
                return Err(AegisError::RateLimited {
                    category: category.as_str().to_string(),
                    retry_after_secs,
                });
            }

            trace.lock().unwrap().begin_request();
            let started = Instant::now();
            let call = async {
                let token = tokens.current_or_refresh().await?;
                match endpoint {
                    Endpoint::Health => transport.get(endpoint, Some(&token)).await,
                    _ => transport.post_json(endpoint, &payload, Some(&token)).await,
                }
            };

            match breaker.execute(endpoint.as_str(), call).await {
                Ok(response) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    trace.lock().unwrap().record_success(elapsed_ms);
                    debug!(
                        endpoint = endpoint.as_str(),
                        elapsed_ms, "Gateway request succeeded"
                    );
                    if let Some((cache, key)) = &cache_slot {
                        cache.insert(key, Arc::new(response.clone()));
                    }
                    Ok(response)
                }
                Err(e) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    trace.lock().unwrap().record_failure(e.kind());
                    warn!(
                        endpoint = endpoint.as_str(),
                        elapsed_ms,
                        error = %e,
                        "Gateway request failed"
                    );
                    Err(e)
                }
            }
        };

        match key {
            Some(key) => self.inflight.execute_or_join(&key, operation).await,
            None => operation.await.map(Arc::new),
        }
    }

    fn mark_guard_outcome(&self, names: &[String], success: bool) {
        let now = Utc::now().to_rfc3339();
        let mut guards = self.guards.write().unwrap();
        for name in names {
            if let Some(state) = guards.get_mut(name) {
                state.last_used = Some(now.clone());
                if success {
                    state.success_count += 1;
                } else {
                    state.error_count += 1;
                }
            }
        }
    }

    /// Append a history entry for a completed analysis. Best effort; a
    /// storage failure never fails the analysis that produced it.
    async fn record_history(&self, analysis_id: &str, text: &str, response: &Value) {
        let preview: String = text
            .chars()
            .take(GatewayConfig::MAX_LOG_FIELD_LENGTH)
            .collect();
        let score = response
            .get("overall_score")
            .or_else(|| response.get("score"))
            .cloned()
            .unwrap_or(Value::Null);
        let entry = json!({
            "analysis_id": analysis_id,
            "text": preview,
            "score": score,
            "bias_type": response.get("bias_type").cloned().unwrap_or(Value::Null),
            "timestamp": Utc::now().to_rfc3339(),
            "success": true,
        });

        if let Err(e) = self.quota.append_history(entry).await {
            warn!(analysis_id = %analysis_id, error = %e, "Failed to record analysis history");
        }
    }

    async fn persist_guards(&self, guards: &HashMap<String, GuardState>) -> Result<()> {
        let record = serde_json::to_value(guards)?;
        self.quota
            .store(
                StorageKeys::GUARD_SETTINGS,
                record,
                AreaKind::Sync,
                StoreOptions::default(),
            )
            .await?;
        Ok(())
    }
}

impl Drop for ResilientClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Endpoint-specific request shape rules, applied before any network or
/// resilience machinery runs.
fn validate_request(endpoint: Endpoint, payload: &Value) -> Result<()> {
    match endpoint {
        Endpoint::Analyze => {
            let text = payload.get("text").and_then(Value::as_str).unwrap_or("");
            if text.trim().is_empty() {
                return Err(AegisError::Validation {
                    field: "text".to_string(),
                    message: "analysis text must not be empty".to_string(),
                });
            }
            if text.chars().count() > GatewayConfig::MAX_TEXT_LENGTH {
                return Err(AegisError::Validation {
                    field: "text".to_string(),
                    message: format!(
                        "analysis text exceeds {} characters",
                        GatewayConfig::MAX_TEXT_LENGTH
                    ),
                });
            }
        }
        Endpoint::Logging => {
            let entries = payload.get("entries").and_then(Value::as_array);
            let entries = match entries {
                Some(entries) if !entries.is_empty() => entries,
                _ => {
                    return Err(AegisError::Validation {
                        field: "entries".to_string(),
                        message: "log batch requires a non-empty entries array".to_string(),
                    })
                }
            };
            for entry in entries {
                let level = entry.get("level").and_then(Value::as_str).unwrap_or("");
                let message = entry.get("message").and_then(Value::as_str).unwrap_or("");
                if level.is_empty() || message.is_empty() {
                    return Err(AegisError::Validation {
                        field: "entries".to_string(),
                        message: "log entries require a level and a message".to_string(),
                    });
                }
            }
        }
        Endpoint::Config => {
            if !payload.is_object() {
                return Err(AegisError::Validation {
                    field: "payload".to_string(),
                    message: "configuration payload must be an object".to_string(),
                });
            }
        }
        Endpoint::Health | Endpoint::Guards => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentials;
    use crate::locks::LocalLockManager;
    use crate::storage::{MemoryArea, StorageArea};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct MockTransport {
        queue: Mutex<VecDeque<std::result::Result<Value, AegisError>>>,
        default: std::result::Result<Value, AegisError>,
        calls: AtomicU32,
        last_payload: Mutex<Option<Value>>,
        delay: Option<Duration>,
    }

    impl MockTransport {
        fn ok_with(default: Value) -> Self {
            Self {
                queue: Mutex::new(VecDeque::new()),
                default: Ok(default),
                calls: AtomicU32::new(0),
                last_payload: Mutex::new(None),
                delay: None,
            }
        }

        fn ok() -> Self {
            Self::ok_with(json!({"status": "ok"}))
        }

        fn failing() -> Self {
            Self {
                queue: Mutex::new(VecDeque::new()),
                default: Err(AegisError::Network {
                    message: "connection refused".to_string(),
                    status: None,
                }),
                calls: AtomicU32::new(0),
                last_payload: Mutex::new(None),
                delay: None,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn next(&self) -> std::result::Result<Value, AegisError> {
            let mut queue = self.queue.lock().unwrap();
            if let Some(scripted) = queue.pop_front() {
                return scripted;
            }
            match &self.default {
                Ok(value) => Ok(value.clone()),
                Err(e) => Err(e.shallow_clone()),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn last_payload(&self) -> Option<Value> {
            self.last_payload.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GatewayTransport for MockTransport {
        async fn post_json(
            &self,
            _endpoint: Endpoint,
            body: &Value,
            _token: Option<&str>,
        ) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_payload.lock().unwrap() = Some(body.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.next()
        }

        async fn get(&self, _endpoint: Endpoint, _token: Option<&str>) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.next()
        }
    }

    fn client_with_areas(
        transport: Arc<MockTransport>,
        local: Arc<dyn StorageArea>,
        sync: Arc<dyn StorageArea>,
    ) -> ResilientClient {
        let quota = Arc::new(QuotaManager::new(local, sync));
        let tokens = TokenGate::new(
            Arc::new(StaticCredentials::new("test-token")),
            Arc::new(LocalLockManager::new()),
        );
        ResilientClient::new(transport, quota, tokens)
    }

    fn client_with(transport: Arc<MockTransport>) -> ResilientClient {
        client_with_areas(
            transport,
            Arc::new(MemoryArea::new()),
            Arc::new(MemoryArea::new()),
        )
    }

    #[tokio::test]
    async fn test_analyze_text_sends_expected_payload() {
        let transport = Arc::new(MockTransport::ok());
        let client = client_with(Arc::clone(&transport));

        let result = client
            .analyze_text("check this out", AnalyzeOptions::default())
            .await;
        assert!(result.is_ok());
        assert_eq!(transport.calls(), 1);

        let payload = transport.last_payload().unwrap();
        assert_eq!(payload["text"], "check this out");
        assert!(payload["analysis_id"]
            .as_str()
            .unwrap()
            .starts_with("analysis_"));
        assert_eq!(
            payload["guards"],
            json!(["biasguard", "trustguard"]),
            "default-enabled guards, sorted"
        );
        assert_eq!(payload["options"]["pipeline"], "default");
        assert!(payload["options"]["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_analyze_text_rejects_empty_text() {
        let transport = Arc::new(MockTransport::ok());
        let client = client_with(Arc::clone(&transport));

        let result = client.analyze_text("   ", AnalyzeOptions::default()).await;
        assert!(matches!(
            result,
            Err(AegisError::Validation { ref field, .. }) if field == "text"
        ));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_analyze_text_truncates_oversized_text() {
        let transport = Arc::new(MockTransport::ok());
        let client = client_with(Arc::clone(&transport));

        let huge = "a".repeat(GatewayConfig::MAX_TEXT_LENGTH * 2);
        client
            .analyze_text(&huge, AnalyzeOptions::default())
            .await
            .unwrap();

        let payload = transport.last_payload().unwrap();
        let sent = payload["text"].as_str().unwrap();
        assert_eq!(sent.chars().count(), GatewayConfig::MAX_TEXT_LENGTH);
    }

    #[tokio::test]
    async fn test_analyze_text_strips_markup() {
        let transport = Arc::new(MockTransport::ok());
        let client = client_with(Arc::clone(&transport));

        client
            .analyze_text(
                "before <script>alert('x')</script> after",
                AnalyzeOptions::default(),
            )
            .await
            .unwrap();

        let payload = transport.last_payload().unwrap();
        let sent = payload["text"].as_str().unwrap();
        assert!(!sent.contains("script"));
        assert!(sent.contains("before"));
        assert!(sent.contains("after"));
    }

    #[tokio::test]
    async fn test_second_identical_analysis_served_from_cache() {
        let transport = Arc::new(MockTransport::ok());
        let client = client_with(Arc::clone(&transport));

        let first = client
            .analyze_text("same text", AnalyzeOptions::default())
            .await
            .unwrap();
        let second = client
            .analyze_text("same text", AnalyzeOptions::default())
            .await
            .unwrap();

        assert_eq!(transport.calls(), 1);
        assert_eq!(*first, *second);
    }

    #[tokio::test]
    async fn test_concurrent_identical_analyses_share_one_call() {
        let transport = Arc::new(MockTransport::ok().with_delay(Duration::from_millis(50)));
        let client = Arc::new(client_with(Arc::clone(&transport)));

        let a = {
            let client = Arc::clone(&client);
            tokio::spawn(
                async move { client.analyze_text("dup", AnalyzeOptions::default()).await },
            )
        };
        let b = {
            let client = Arc::clone(&client);
            tokio::spawn(
                async move { client.analyze_text("dup", AnalyzeOptions::default()).await },
            )
        };

        let first = a.await.unwrap().unwrap();
        let second = b.await.unwrap().unwrap();

        assert_eq!(transport.calls(), 1);
        assert_eq!(*first, *second);
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_with_retry_hint() {
        let transport = Arc::new(MockTransport::ok());
        let client = client_with(Arc::clone(&transport)).with_rate_limiter(
            SlidingWindowLimiter::new().with_limit(
                RateCategory::Analysis,
                1,
                Duration::from_secs(60),
            ),
        );

        client
            .analyze_text("first", AnalyzeOptions::default())
            .await
            .unwrap();
        let denied = client
            .analyze_text("second", AnalyzeOptions::default())
            .await;

        assert_eq!(transport.calls(), 1);
        match denied {
            Err(AegisError::RateLimited {
                category,
                retry_after_secs,
            }) => {
                assert_eq!(category, "analysis");
                assert!(retry_after_secs >= 1);
            }
            other => panic!("expected RateLimited, got {:?}", other.map(|v| (*v).clone())),
        }

        let stats = client.stats();
        assert_eq!(stats.error_counts.get("rate_limited"), Some(&1));
        assert_eq!(stats.requests, 1, "denied call is not counted as a request");
    }

    #[tokio::test]
    async fn test_breaker_opens_after_repeated_failures() {
        let transport = Arc::new(MockTransport::failing());
        let client = client_with(Arc::clone(&transport))
            .with_breaker_config(BreakerConfig::default().with_failure_threshold(2));

        let first = client.analyze_text("one", AnalyzeOptions::default()).await;
        let second = client.analyze_text("two", AnalyzeOptions::default()).await;
        assert!(matches!(first, Err(AegisError::Network { .. })));
        assert!(matches!(second, Err(AegisError::Network { .. })));

        let rejected = client.analyze_text("three", AnalyzeOptions::default()).await;
        assert!(matches!(rejected, Err(AegisError::CircuitOpen { .. })));
        assert_eq!(transport.calls(), 2, "open circuit skips the network");
    }

    #[tokio::test]
    async fn test_guard_counters_track_outcomes() {
        let transport = Arc::new(MockTransport::ok());
        let client = client_with(Arc::clone(&transport));

        client
            .analyze_text("good", AnalyzeOptions::default())
            .await
            .unwrap();

        {
            let guards = client.guards.read().unwrap();
            let bias = guards.get("biasguard").unwrap();
            assert_eq!(bias.success_count, 1);
            assert_eq!(bias.error_count, 0);
            assert!(bias.last_used.is_some());
            let security = guards.get("securityguard").unwrap();
            assert_eq!(security.success_count, 0, "disabled guard untouched");
        }

        let failing = Arc::new(MockTransport::failing());
        let client = client_with(Arc::clone(&failing));
        let _ = client.analyze_text("bad", AnalyzeOptions::default()).await;
        let guards = client.guards.read().unwrap();
        assert_eq!(guards.get("trustguard").unwrap().error_count, 1);
    }

    #[tokio::test]
    async fn test_analysis_history_recorded() {
        let transport = Arc::new(MockTransport::ok_with(
            json!({"overall_score": 0.42, "bias_type": "framing"}),
        ));
        let sync: Arc<dyn StorageArea> = Arc::new(MemoryArea::new());
        let client = client_with_areas(
            Arc::clone(&transport),
            Arc::new(MemoryArea::new()),
            Arc::clone(&sync),
        );

        client
            .analyze_text("score me", AnalyzeOptions::default())
            .await
            .unwrap();

        let stored = sync
            .get(&[StorageKeys::ANALYSIS_HISTORY.to_string()])
            .await
            .unwrap();
        let history = stored
            .get(StorageKeys::ANALYSIS_HISTORY)
            .and_then(Value::as_array)
            .cloned()
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["score"], 0.42);
        assert_eq!(history[0]["text"], "score me");
        assert_eq!(history[0]["success"], true);
    }

    #[tokio::test]
    async fn test_update_guard_service_persists() {
        let transport = Arc::new(MockTransport::ok());
        let sync: Arc<dyn StorageArea> = Arc::new(MemoryArea::new());
        let client = client_with_areas(
            Arc::clone(&transport),
            Arc::new(MemoryArea::new()),
            Arc::clone(&sync),
        );

        let update = GuardUpdate {
            enabled: Some(false),
            ..Default::default()
        };
        let state = client
            .update_guard_service("biasguard", update)
            .await
            .unwrap();
        assert!(!state.enabled);

        let stored = sync
            .get(&[StorageKeys::GUARD_SETTINGS.to_string()])
            .await
            .unwrap();
        let saved = stored.get(StorageKeys::GUARD_SETTINGS).unwrap();
        assert_eq!(saved["biasguard"]["enabled"], false);

        client
            .analyze_text("still works", AnalyzeOptions::default())
            .await
            .unwrap();
        let payload = transport.last_payload().unwrap();
        assert_eq!(payload["guards"], json!(["trustguard"]));
    }

    #[tokio::test]
    async fn test_update_unknown_guard_service_rejected() {
        let transport = Arc::new(MockTransport::ok());
        let client = client_with(transport);

        let result = client
            .update_guard_service("missingguard", GuardUpdate::default())
            .await;
        assert!(matches!(
            result,
            Err(AegisError::Validation { ref field, .. }) if field == "service"
        ));
    }

    #[tokio::test]
    async fn test_central_config_round_trip() {
        let transport = Arc::new(MockTransport::ok());
        let sync: Arc<dyn StorageArea> = Arc::new(MemoryArea::new());
        let client = client_with_areas(
            Arc::clone(&transport),
            Arc::new(MemoryArea::new()),
            Arc::clone(&sync),
        );

        let initial = client.central_config().await.unwrap();
        assert!(initial.api_key_configured);
        assert_eq!(initial.analysis_pipeline, "default");

        let update = CentralConfigUpdate {
            analysis_pipeline: Some("deep_analysis_v2".to_string()),
            ..Default::default()
        };
        let updated = client.update_central_config(update).await.unwrap();
        assert_eq!(updated.analysis_pipeline, "deep_analysis_v2");

        let stored = sync
            .get(&[StorageKeys::CENTRAL_CONFIG.to_string()])
            .await
            .unwrap();
        let saved = stored.get(StorageKeys::CENTRAL_CONFIG).unwrap();
        assert_eq!(saved["analysis_pipeline"], "deep_analysis_v2");
    }

    #[tokio::test]
    async fn test_update_central_config_rejects_bad_url() {
        let transport = Arc::new(MockTransport::ok());
        let client = client_with(transport);

        let update = CentralConfigUpdate {
            gateway_url: Some("not a url".to_string()),
            ..Default::default()
        };
        let result = client.update_central_config(update).await;
        assert!(matches!(
            result,
            Err(AegisError::Validation { ref field, .. }) if field == "gateway_url"
        ));
    }

    #[tokio::test]
    async fn test_submit_log_batch_enriches_entries() {
        let transport = Arc::new(MockTransport::ok());
        let client = client_with(Arc::clone(&transport));

        let entries = vec![
            LogEntry::new("info", "started"),
            LogEntry::new("warn", "slow response")
                .with_metadata(json!({"api_key": "secret", "elapsed_ms": 900})),
        ];
        let submitted = client.submit_log_batch(entries).await.unwrap();
        assert_eq!(submitted, 2);
        assert_eq!(transport.calls(), 1);

        let payload = transport.last_payload().unwrap();
        let sent = payload["entries"].as_array().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1]["metadata"]["api_key"], "***REDACTED***");
        assert_eq!(sent[1]["metadata"]["elapsed_ms"], 900);
        assert!(sent[0]["metadata"]["timestamp"].is_string());
        assert!(sent[0]["metadata"]["client_version"].is_string());
    }

    #[tokio::test]
    async fn test_submit_log_batch_validates_entries() {
        let transport = Arc::new(MockTransport::ok());
        let client = client_with(Arc::clone(&transport));

        let empty = client.submit_log_batch(Vec::new()).await;
        assert!(matches!(empty, Err(AegisError::Validation { .. })));

        let missing_level = client
            .submit_log_batch(vec![LogEntry::new("", "message")])
            .await;
        assert!(matches!(missing_level, Err(AegisError::Validation { .. })));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_trace_stats_track_successes_and_failures() {
        let transport = Arc::new(MockTransport::ok());
        {
            let mut queue = transport.queue.lock().unwrap();
            queue.push_back(Ok(json!({"status": "ok"})));
            queue.push_back(Err(AegisError::Network {
                message: "boom".to_string(),
                status: Some(502),
            }));
        }
        let client = client_with(Arc::clone(&transport));

        client
            .analyze_text("works", AnalyzeOptions::default())
            .await
            .unwrap();
        let _ = client.analyze_text("fails", AnalyzeOptions::default()).await;

        let stats = client.stats();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.error_counts.get("network"), Some(&1));
        assert_eq!(stats.success_rate, 50.0);
        assert!(stats.last_request_time.is_some());
    }

    #[tokio::test]
    async fn test_load_state_restores_guards_and_config() {
        let transport = Arc::new(MockTransport::ok());
        let sync: Arc<dyn StorageArea> = Arc::new(MemoryArea::new());

        let mut seed = HashMap::new();
        seed.insert(
            StorageKeys::GUARD_SETTINGS.to_string(),
            json!({
                "securityguard": {
                    "enabled": true,
                    "threshold": 0.9,
                    "pipeline": "security_analysis_v1",
                    "display_name": "Security Analysis",
                    "success_count": 7
                },
                "retiredguard": {
                    "enabled": true,
                    "threshold": 0.1,
                    "pipeline": "gone",
                    "display_name": "Gone"
                }
            }),
        );
        seed.insert(
            StorageKeys::CENTRAL_CONFIG.to_string(),
            json!({"analysis_pipeline": "custom_v3"}),
        );
        sync.set(seed).await.unwrap();

        let client = client_with_areas(
            Arc::clone(&transport),
            Arc::new(MemoryArea::new()),
            Arc::clone(&sync),
        );
        client.load_state().await.unwrap();

        {
            let guards = client.guards.read().unwrap();
            let security = guards.get("securityguard").unwrap();
            assert!(security.enabled);
            assert_eq!(security.success_count, 7);
            assert!(!guards.contains_key("retiredguard"));
        }
        let config = client.central_config().await.unwrap();
        assert_eq!(config.analysis_pipeline, "custom_v3");
    }

    #[tokio::test]
    async fn test_diagnostics_cover_every_layer() {
        let transport = Arc::new(MockTransport::ok());
        let client = client_with(Arc::clone(&transport));

        client
            .analyze_text("inspect", AnalyzeOptions::default())
            .await
            .unwrap();

        let diagnostics = client.diagnostics().await.unwrap();
        assert!(diagnostics.instance_id.starts_with("client_"));
        assert_eq!(diagnostics.trace.requests, 1);
        assert_eq!(diagnostics.rate_limits.len(), 3);
        assert_eq!(diagnostics.guard_services.len(), 6);
        assert_eq!(diagnostics.cache.entries, 1);
        assert!(diagnostics.storage.sync.bytes_used > 0, "history was written");
        assert_eq!(diagnostics.configuration.analysis_pipeline, "default");
    }

    #[tokio::test]
    async fn test_sweeper_lifecycle() {
        let transport = Arc::new(MockTransport::ok());
        let client = client_with(transport);

        client.start_sweeper();
        client.start_sweeper();
        assert!(client.sweeper.lock().unwrap().is_some());

        client.shutdown();
        assert!(client.sweeper.lock().unwrap().is_none());
    }
}
