//! Error types for the Aegis resilience layer.
//!
//! This module defines the error taxonomy shared by every component, with
//! conversions from the underlying transport/storage crates and mappings to
//! stable RPC error codes for the coordinator boundary.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Aegis operations.
#[derive(Debug, Error)]
pub enum AegisError {
    // Transport errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// HTTP status when the failure came from a response
        status: Option<u16>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    // Resilience fast-fail errors
    #[error("Circuit open: retry in {retry_after_secs}s")]
    CircuitOpen { retry_after_secs: u64 },

    #[error("Rate limit exceeded for {category}: retry in {retry_after_secs}s")]
    RateLimited {
        category: String,
        retry_after_secs: u64,
    },

    // Storage errors
    #[error("Record too large even after compression: {size_bytes} bytes (limit {limit_bytes})")]
    QuotaExceeded { size_bytes: u64, limit_bytes: u64 },

    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Coordination errors
    #[error("Lock error for {name}: {message}")]
    Lock { name: String, message: String },

    #[error("Authentication error: {message}")]
    Auth { message: String },

    // Request validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Aegis operations.
pub type Result<T> = std::result::Result<T, AegisError>;

// Conversion implementations for common error types

impl From<std::io::Error> for AegisError {
    fn from(err: std::io::Error) -> Self {
        AegisError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for AegisError {
    fn from(err: serde_json::Error) -> Self {
        AegisError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for AegisError {
    fn from(err: rusqlite::Error) -> Self {
        AegisError::Storage {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for AegisError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AegisError::Timeout(std::time::Duration::from_secs(0))
        } else {
            AegisError::Network {
                message: err.to_string(),
                status: err.status().map(|s| s.as_u16()),
            }
        }
    }
}

impl AegisError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        AegisError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32600: Invalid Request
    /// - -32601: Method not found
    /// - -32603: Internal error
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Network/timeout error
    /// - -32001: Circuit open
    /// - -32002: Rate limited
    /// - -32003: Quota exceeded
    /// - -32004: Lock/auth failure
    /// - -32005: Validation error
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            AegisError::Network { .. } | AegisError::Timeout(_) => -32000,

            AegisError::CircuitOpen { .. } => -32001,

            AegisError::RateLimited { .. } => -32002,

            AegisError::QuotaExceeded { .. } => -32003,

            AegisError::Lock { .. } | AegisError::Auth { .. } => -32004,

            AegisError::Validation { .. } => -32005,

            // All other errors are internal errors
            _ => -32603,
        }
    }

    /// Check if this error may be retried by the caller.
    ///
    /// Circuit-open and rate-limited rejections carry their own retry-after
    /// hints and are deliberately excluded; retrying them immediately would
    /// defeat the fast-fail contract.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AegisError::Network { .. } | AegisError::Timeout(_))
    }

    /// Seconds the caller should wait before trying again, when known.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            AegisError::CircuitOpen { retry_after_secs }
            | AegisError::RateLimited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Stable label for grouping errors in counters and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            AegisError::Network { .. } => "network",
            AegisError::Timeout(_) => "timeout",
            AegisError::CircuitOpen { .. } => "circuit_open",
            AegisError::RateLimited { .. } => "rate_limited",
            AegisError::QuotaExceeded { .. } => "quota_exceeded",
            AegisError::Storage { .. } => "storage",
            AegisError::Io { .. } => "io",
            AegisError::Json { .. } => "json",
            AegisError::Lock { .. } => "lock",
            AegisError::Auth { .. } => "auth",
            AegisError::Validation { .. } => "validation",
            AegisError::Config { .. } => "config",
            AegisError::Other(_) => "other",
        }
    }

    /// Clone the error's data, dropping non-cloneable `source` chains.
    ///
    /// Used when one failure must be delivered to several waiters, e.g. all
    /// callers joined on a deduplicated in-flight request.
    pub fn shallow_clone(&self) -> Self {
        match self {
            AegisError::Network { message, status } => AegisError::Network {
                message: message.clone(),
                status: *status,
            },
            AegisError::Timeout(d) => AegisError::Timeout(*d),
            AegisError::CircuitOpen { retry_after_secs } => AegisError::CircuitOpen {
                retry_after_secs: *retry_after_secs,
            },
            AegisError::RateLimited {
                category,
                retry_after_secs,
            } => AegisError::RateLimited {
                category: category.clone(),
                retry_after_secs: *retry_after_secs,
            },
            AegisError::QuotaExceeded {
                size_bytes,
                limit_bytes,
            } => AegisError::QuotaExceeded {
                size_bytes: *size_bytes,
                limit_bytes: *limit_bytes,
            },
            AegisError::Storage { message, .. } => AegisError::Storage {
                message: message.clone(),
                source: None,
            },
            AegisError::Io { message, path, .. } => AegisError::Io {
                message: message.clone(),
                path: path.clone(),
                source: None,
            },
            AegisError::Json { message, .. } => AegisError::Json {
                message: message.clone(),
                source: None,
            },
            AegisError::Lock { name, message } => AegisError::Lock {
                name: name.clone(),
                message: message.clone(),
            },
            AegisError::Auth { message } => AegisError::Auth {
                message: message.clone(),
            },
            AegisError::Validation { field, message } => AegisError::Validation {
                field: field.clone(),
                message: message.clone(),
            },
            AegisError::Config { message } => AegisError::Config {
                message: message.clone(),
            },
            AegisError::Other(message) => AegisError::Other(message.clone()),
        }
    }
}
