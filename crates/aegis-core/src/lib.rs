//! Aegis Core - Resilience layer for the content-analysis gateway.
//!
//! This crate wraps every call to the analysis backend in a uniform set of
//! protective layers: response caching, in-flight deduplication, sliding-
//! window rate limiting, circuit breaking, serialized credential refresh,
//! and quota-bounded persistence. It can be used programmatically without
//! any HTTP/RPC layer.
//!
//! For the JSON-RPC coordinator binary, see the `aegis-rpc` crate.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use aegis_core::{
//!     AnalyzeOptions, HttpTransport, LocalLockManager, QuotaManager,
//!     ResilientClient, SqliteStore, StaticCredentials, TokenGate,
//!     TransportConfig,
//! };
//! use aegis_core::storage::AreaKind;
//!
//! #[tokio::main]
//! async fn main() -> aegis_core::Result<()> {
//!     let store = SqliteStore::new("/var/lib/aegis/storage.db")?;
//!     let quota = Arc::new(QuotaManager::new(
//!         Arc::new(store.area(AreaKind::Local)),
//!         Arc::new(store.area(AreaKind::Sync)),
//!     ));
//!     let tokens = TokenGate::new(
//!         Arc::new(StaticCredentials::new("api-key")),
//!         Arc::new(LocalLockManager::new()),
//!     );
//!     let transport = Arc::new(HttpTransport::new(TransportConfig::default())?);
//!
//!     let client = ResilientClient::new(transport, quota, tokens);
//!     let result = client.analyze_text("check this", AnalyzeOptions::default()).await?;
//!     println!("verdict: {}", result);
//!
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod ipc;
pub mod locks;
pub mod models;
pub mod network;
pub mod ratelimit;
pub mod sanitize;
pub mod storage;

// Re-export commonly used types
pub use auth::{CredentialProvider, StaticCredentials, StorageCredentials, TokenGate};
pub use cache::{cache_key, CacheConfig, CacheStats, InflightRegistry, ResponseCache};
pub use client::{ClientConfig, Diagnostics, ResilientClient};
pub use config::{Endpoint, GatewayConfig, GuardService, RateCategory, StorageKeys};
pub use error::{AegisError, Result};
pub use ipc::{Dispatcher, Envelope, EventKind};
pub use locks::{with_lock, LeaseConfig, LeaseLock, LocalLockManager, LockGuard, NamedLock};
pub use models::{
    AnalyzeOptions, CentralConfig, CentralConfigUpdate, GuardState, GuardStatusReport,
    GuardSummary, GuardUpdate, LogEntry, TraceStats,
};
pub use network::{
    BreakerConfig, CircuitBreaker, CircuitBreakerStats, CircuitState, GatewayTransport,
    HttpTransport, TransportConfig,
};
pub use ratelimit::SlidingWindowLimiter;
pub use storage::{
    AreaKind, MemoryArea, QuotaConfig, QuotaManager, SqliteStore, StorageArea, StoreOptions,
};
