//! Data models shared by the client, coordinator, and storage layers.

use crate::config::GuardService;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Runtime state of one guard service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardState {
    pub enabled: bool,
    pub threshold: f64,
    pub pipeline: String,
    pub display_name: String,
    #[serde(default)]
    pub last_used: Option<String>,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub error_count: u64,
}

impl GuardState {
    /// Initial state for a guard, per its service defaults.
    pub fn defaults_for(service: GuardService) -> Self {
        Self {
            enabled: service.default_enabled(),
            threshold: service.default_threshold(),
            pipeline: service.default_pipeline().to_string(),
            display_name: service.display_name().to_string(),
            last_used: None,
            success_count: 0,
            error_count: 0,
        }
    }

    /// Percentage of recorded calls that succeeded.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.error_count;
        if total == 0 {
            return 0.0;
        }
        self.success_count as f64 / total as f64 * 100.0
    }
}

/// Partial update applied onto a [`GuardState`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl GuardUpdate {
    pub fn apply(&self, state: &mut GuardState) {
        if let Some(enabled) = self.enabled {
            state.enabled = enabled;
        }
        if let Some(threshold) = self.threshold {
            state.threshold = threshold;
        }
        if let Some(pipeline) = &self.pipeline {
            state.pipeline = pipeline.clone();
        }
        if let Some(display_name) = &self.display_name {
            state.display_name = display_name.clone();
        }
    }
}

/// Per-guard entry in a [`GuardStatusReport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardSummary {
    pub enabled: bool,
    pub last_used: Option<String>,
    pub success_count: u64,
    pub error_count: u64,
    pub success_rate: f64,
}

impl From<&GuardState> for GuardSummary {
    fn from(state: &GuardState) -> Self {
        Self {
            enabled: state.enabled,
            last_used: state.last_used.clone(),
            success_count: state.success_count,
            error_count: state.error_count,
            success_rate: state.success_rate(),
        }
    }
}

/// Aggregate guard service status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardStatusReport {
    pub gateway_connected: bool,
    pub guard_services: HashMap<String, GuardSummary>,
    pub total_requests: u64,
    pub success_rate: f64,
}

/// Caller-supplied options for a text analysis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyzeOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    /// Free-form context forwarded to the backend untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl AnalyzeOptions {
    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = Some(priority.into());
        self
    }
}

/// Deployment-wide configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentralConfig {
    pub gateway_url: String,
    pub api_key_configured: bool,
    pub guard_services: HashMap<String, GuardState>,
    pub logging_config: Value,
    pub analysis_pipeline: String,
}

/// Partial update to the central configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CentralConfigUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging_config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_pipeline: Option<String>,
}

/// One entry in a log batch bound for the central logging endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl LogEntry {
    pub fn new(level: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            message: message.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Request-level counters kept by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_response_time_ms: u64,
    pub average_response_time_ms: f64,
    pub last_request_time: Option<String>,
    pub error_counts: HashMap<String, u64>,
    pub success_rate: f64,
    pub failure_rate: f64,
}
