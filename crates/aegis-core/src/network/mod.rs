//! Network utilities for gateway calls and resilience.
//!
//! This module provides:
//! - Circuit breaker pattern with per-call timeouts
//! - HTTP transport with the gateway's standard headers
//! - Correlation id generation

mod breaker;
mod transport;

pub use breaker::{
    BreakerConfig, CircuitBreaker, CircuitBreakerStats, CircuitState, TransitionRecord,
};
pub use transport::{generate_id, GatewayTransport, HttpTransport, TransportConfig};
