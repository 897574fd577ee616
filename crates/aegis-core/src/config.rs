//! Centralized configuration for the Aegis resilience layer.
//!
//! This module provides configuration constants for the gateway connection,
//! storage key naming, and the closed sets of endpoints, rate categories, and
//! guard services. Component-specific tunables (breaker thresholds, cache TTLs,
//! quota budgets) live next to their components.

use std::time::Duration;

/// Gateway connection defaults.
pub struct GatewayConfig;

impl GatewayConfig {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.aegis-gateway.dev";
    pub const CLIENT_VERSION: &'static str = env!("CARGO_PKG_VERSION");
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_TEXT_LENGTH: usize = 10_000;
    // Log-bound payload copies truncate free text to this many characters.
    pub const MAX_LOG_FIELD_LENGTH: usize = 100;
}

/// Well-known keys and prefixes in the persistent store.
pub struct StorageKeys;

impl StorageKeys {
    pub const ANALYSIS_HISTORY: &'static str = "analysis_history";
    pub const CENTRAL_CONFIG: &'static str = "central_config";
    pub const GUARD_SETTINGS: &'static str = "guard_services";
    pub const LEASE_PREFIX: &'static str = "_lock_";
    /// Keys with these prefixes are ephemeral and evicted first under
    /// quota pressure.
    pub const EPHEMERAL_PREFIXES: [&'static str; 2] = ["_temp_", "_debug_"];
}

/// Backend endpoints the client is allowed to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Analyze,
    Health,
    Logging,
    Guards,
    Config,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Analyze => "analyze",
            Endpoint::Health => "health",
            Endpoint::Logging => "logging",
            Endpoint::Guards => "guards",
            Endpoint::Config => "config",
        }
    }

    /// URL path relative to the gateway base.
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Analyze => "api/v1/analyze",
            Endpoint::Health => "api/v1/health",
            Endpoint::Logging => "api/v1/logging",
            Endpoint::Guards => "api/v1/guards",
            Endpoint::Config => "api/v1/config",
        }
    }

    /// Rate-limit category charged for calls to this endpoint.
    pub fn rate_category(&self) -> RateCategory {
        match self {
            Endpoint::Analyze => RateCategory::Analysis,
            Endpoint::Logging => RateCategory::Logging,
            _ => RateCategory::Api,
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "analyze" => Some(Endpoint::Analyze),
            "health" => Some(Endpoint::Health),
            "logging" => Some(Endpoint::Logging),
            "guards" => Some(Endpoint::Guards),
            "config" => Some(Endpoint::Config),
            _ => None,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rate-limit categories with independent windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateCategory {
    Api,
    Analysis,
    Logging,
}

impl RateCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateCategory::Api => "api",
            RateCategory::Analysis => "analysis",
            RateCategory::Logging => "logging",
        }
    }

    /// Default `(max requests, window)` for this category.
    pub fn default_limit(&self) -> (u32, Duration) {
        match self {
            RateCategory::Api => (10, Duration::from_secs(60)),
            RateCategory::Analysis => (5, Duration::from_secs(30)),
            RateCategory::Logging => (20, Duration::from_secs(60)),
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "api" => Some(RateCategory::Api),
            "analysis" => Some(RateCategory::Analysis),
            "logging" => Some(RateCategory::Logging),
            _ => None,
        }
    }

    pub const ALL: [RateCategory; 3] = [
        RateCategory::Api,
        RateCategory::Analysis,
        RateCategory::Logging,
    ];
}

impl std::fmt::Display for RateCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Guard services exposed by the analysis backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardService {
    Bias,
    Trust,
    Context,
    Security,
    Token,
    Health,
}

impl GuardService {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardService::Bias => "biasguard",
            GuardService::Trust => "trustguard",
            GuardService::Context => "contextguard",
            GuardService::Security => "securityguard",
            GuardService::Token => "tokenguard",
            GuardService::Health => "healthguard",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            GuardService::Bias => "Bias Detection",
            GuardService::Trust => "Trust Analysis",
            GuardService::Context => "Context Analysis",
            GuardService::Security => "Security Analysis",
            GuardService::Token => "Token Optimization",
            GuardService::Health => "Health Monitoring",
        }
    }

    /// Backend pipeline executed for this guard.
    pub fn default_pipeline(&self) -> &'static str {
        match self {
            GuardService::Bias => "bias_analysis_v2",
            GuardService::Trust => "trust_analysis_v1",
            GuardService::Context => "context_analysis_v1",
            GuardService::Security => "security_analysis_v1",
            GuardService::Token => "token_optimization_v1",
            GuardService::Health => "health_monitoring_v1",
        }
    }

    /// Score threshold above which a result is flagged.
    pub fn default_threshold(&self) -> f64 {
        match self {
            GuardService::Bias => 0.5,
            GuardService::Trust => 0.7,
            GuardService::Context => 0.6,
            GuardService::Security => 0.8,
            GuardService::Token => 0.5,
            GuardService::Health => 0.5,
        }
    }

    pub fn default_enabled(&self) -> bool {
        matches!(self, GuardService::Bias | GuardService::Trust)
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "biasguard" => Some(GuardService::Bias),
            "trustguard" => Some(GuardService::Trust),
            "contextguard" => Some(GuardService::Context),
            "securityguard" => Some(GuardService::Security),
            "tokenguard" => Some(GuardService::Token),
            "healthguard" => Some(GuardService::Health),
            _ => None,
        }
    }

    pub const ALL: [GuardService; 6] = [
        GuardService::Bias,
        GuardService::Trust,
        GuardService::Context,
        GuardService::Security,
        GuardService::Token,
        GuardService::Health,
    ];
}

impl std::fmt::Display for GuardService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
