//! Circuit breaker pattern for gateway resilience.
//!
//! Wraps arbitrary async operations with a failure-count-based state machine:
//! - CLOSED: Normal operation, requests flow through
//! - OPEN: Failing, requests are rejected immediately with a retry-after hint
//! - HALF_OPEN: Testing recovery, exactly one probe allowed
//!
//! Every call is bounded by a per-call timeout that counts as a failure. The
//! breaker never retries; it only fails fast so callers stop burning resources
//! during an outage.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{AegisError, Result};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - requests flow through.
    Closed,
    /// Failing - requests are rejected immediately.
    Open,
    /// Testing recovery - a single probe request allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Cooldown before a recovery probe is attempted.
    pub reset_timeout: Duration,
    /// Upper bound on any single wrapped call.
    pub call_timeout: Duration,
    /// State transitions kept for diagnostics.
    pub transition_log_size: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(10),
            transition_log_size: 20,
        }
    }
}

impl BreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// One recorded state transition.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: String,
    pub at: String,
    pub failure_count: u32,
}

/// Outcome of asking the breaker for permission to run a call.
enum Permission {
    Allowed,
    Rejected { retry_after_secs: u64 },
}

/// Circuit breaker protecting calls to one upstream.
pub struct CircuitBreaker {
    config: BreakerConfig,
    /// Current state of the circuit.
    state: RwLock<CircuitState>,
    /// Consecutive failure count (reset on success).
    failure_count: AtomicU32,
    /// Lifetime counters.
    total_requests: AtomicU64,
    total_rejected: AtomicU64,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    /// When the circuit was opened.
    opened_at: RwLock<Option<Instant>>,
    /// Probe slots consumed since entering half-open.
    half_open_calls: AtomicU32,
    last_failure_at: RwLock<Option<String>>,
    last_success_at: RwLock<Option<String>>,
    transitions: Mutex<Vec<TransitionRecord>>,
    /// Label for the upstream this breaker protects.
    context: String,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with default configuration.
    pub fn new(context: impl Into<String>) -> Self {
        Self::with_config(context, BreakerConfig::default())
    }

    /// Create a new circuit breaker with custom configuration.
    pub fn with_config(context: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            opened_at: RwLock::new(None),
            half_open_calls: AtomicU32::new(0),
            last_failure_at: RwLock::new(None),
            last_success_at: RwLock::new(None),
            transitions: Mutex::new(Vec::new()),
            context: context.into(),
        }
    }

    /// Run an operation under the breaker's protection.
    ///
    /// When the circuit is open the operation future is never polled and the
    /// caller gets [`AegisError::CircuitOpen`] carrying the remaining cooldown.
    /// While a half-open probe is outstanding, other callers are rejected fast
    /// with a one-second hint. The call is bounded by the configured timeout;
    /// elapsing counts as a failure and surfaces as [`AegisError::Timeout`].
    /// Any error outcome counts toward the failure threshold.
    pub async fn execute<F, T>(&self, label: &str, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.total_requests.fetch_add(1, Ordering::SeqCst);

        match self.acquire_permission() {
            Permission::Allowed => {}
            Permission::Rejected { retry_after_secs } => {
                self.total_rejected.fetch_add(1, Ordering::SeqCst);
                debug!(
                    context = %self.context,
                    label,
                    retry_after_secs,
                    "circuit rejected request"
                );
                return Err(AegisError::CircuitOpen { retry_after_secs });
            }
        }

        match tokio::time::timeout(self.config.call_timeout, operation).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record_failure(&err.to_string());
                Err(err)
            }
            Err(_) => {
                self.record_failure("call timeout");
                Err(AegisError::Timeout(self.config.call_timeout))
            }
        }
    }

    /// Get the current state of the circuit.
    pub fn state(&self) -> CircuitState {
        self.maybe_transition_to_half_open();
        *self.state.read().unwrap()
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Record a successful request.
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::SeqCst);
        self.failure_count.store(0, Ordering::SeqCst);
        *self.last_success_at.write().unwrap() = Some(chrono::Utc::now().to_rfc3339());

        let state = *self.state.read().unwrap();
        if state == CircuitState::HalfOpen {
            self.transition_to_closed("probe succeeded");
        }
    }

    /// Record a failed request with a short reason for the transition log.
    pub fn record_failure(&self, reason: &str) {
        self.total_failures.fetch_add(1, Ordering::SeqCst);
        let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_failure_at.write().unwrap() = Some(chrono::Utc::now().to_rfc3339());

        let state = *self.state.read().unwrap();
        match state {
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold {
                    self.transition_to_open(reason);
                }
            }
            CircuitState::HalfOpen => {
                self.transition_to_open("probe failed");
            }
            CircuitState::Open => {
                // Already open, nothing to do
            }
        }
    }

    /// Get statistics about this circuit breaker.
    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            context: self.context.clone(),
            state: self.state(),
            failure_count: self.failure_count.load(Ordering::SeqCst),
            total_requests: self.total_requests.load(Ordering::SeqCst),
            total_rejected: self.total_rejected.load(Ordering::SeqCst),
            total_failures: self.total_failures.load(Ordering::SeqCst),
            total_successes: self.total_successes.load(Ordering::SeqCst),
            time_in_state_secs: self.time_in_current_state().as_secs(),
            last_failure_at: self.last_failure_at.read().unwrap().clone(),
            last_success_at: self.last_success_at.read().unwrap().clone(),
        }
    }

    /// Snapshot of the recorded state transitions, oldest first.
    pub fn transitions(&self) -> Vec<TransitionRecord> {
        self.transitions.lock().unwrap().clone()
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let from = *self.state.read().unwrap();
        self.failure_count.store(0, Ordering::SeqCst);
        self.half_open_calls.store(0, Ordering::SeqCst);
        *self.opened_at.write().unwrap() = None;
        *self.state.write().unwrap() = CircuitState::Closed;
        if from != CircuitState::Closed {
            self.log_transition(from, CircuitState::Closed, "manual reset");
        }
        info!(context = %self.context, "circuit breaker reset to CLOSED");
    }

    // Internal state transitions

    fn acquire_permission(&self) -> Permission {
        self.maybe_transition_to_half_open();

        let state = *self.state.read().unwrap();
        match state {
            CircuitState::Closed => Permission::Allowed,
            CircuitState::Open => Permission::Rejected {
                retry_after_secs: self.remaining_cooldown_secs(),
            },
            CircuitState::HalfOpen => {
                let calls = self.half_open_calls.fetch_add(1, Ordering::SeqCst);
                if calls == 0 {
                    Permission::Allowed
                } else {
                    // A probe is already in flight; its outcome decides the
                    // next state, so tell callers to come back shortly.
                    Permission::Rejected {
                        retry_after_secs: 1,
                    }
                }
            }
        }
    }

    fn transition_to_open(&self, reason: &str) {
        let mut state = self.state.write().unwrap();
        if *state != CircuitState::Open {
            let from = *state;
            *state = CircuitState::Open;
            drop(state);
            *self.opened_at.write().unwrap() = Some(Instant::now());
            self.half_open_calls.store(0, Ordering::SeqCst);
            self.log_transition(from, CircuitState::Open, reason);
            warn!(
                context = %self.context,
                failures = self.failure_count.load(Ordering::SeqCst),
                reason,
                "circuit breaker opened"
            );
        }
    }

    fn transition_to_half_open(&self) {
        let mut state = self.state.write().unwrap();
        if *state == CircuitState::Open {
            *state = CircuitState::HalfOpen;
            drop(state);
            self.half_open_calls.store(0, Ordering::SeqCst);
            self.log_transition(
                CircuitState::Open,
                CircuitState::HalfOpen,
                "recovery timeout elapsed",
            );
            debug!(context = %self.context, "circuit breaker entering HALF_OPEN");
        }
    }

    fn transition_to_closed(&self, reason: &str) {
        let mut state = self.state.write().unwrap();
        let from = *state;
        *state = CircuitState::Closed;
        drop(state);
        self.failure_count.store(0, Ordering::SeqCst);
        *self.opened_at.write().unwrap() = None;
        if from != CircuitState::Closed {
            self.log_transition(from, CircuitState::Closed, reason);
        }
        info!(context = %self.context, "circuit breaker recovered to CLOSED");
    }

    fn maybe_transition_to_half_open(&self) {
        let state = *self.state.read().unwrap();
        if state != CircuitState::Open {
            return;
        }

        let opened_at = *self.opened_at.read().unwrap();
        if let Some(opened) = opened_at {
            if opened.elapsed() >= self.config.reset_timeout {
                self.transition_to_half_open();
            }
        }
    }

    fn remaining_cooldown_secs(&self) -> u64 {
        let opened_at = *self.opened_at.read().unwrap();
        match opened_at {
            Some(opened) => {
                let remaining = self
                    .config
                    .reset_timeout
                    .saturating_sub(opened.elapsed());
                // Round up so the caller never retries a hair too early.
                let mut secs = remaining.as_secs();
                if remaining.subsec_nanos() > 0 {
                    secs += 1;
                }
                secs
            }
            None => 0,
        }
    }

    fn log_transition(&self, from: CircuitState, to: CircuitState, reason: &str) {
        let mut log = self.transitions.lock().unwrap();
        log.push(TransitionRecord {
            from,
            to,
            reason: reason.to_string(),
            at: chrono::Utc::now().to_rfc3339(),
            failure_count: self.failure_count.load(Ordering::SeqCst),
        });
        let overflow = log.len().saturating_sub(self.config.transition_log_size);
        if overflow > 0 {
            log.drain(..overflow);
        }
    }

    fn time_in_current_state(&self) -> Duration {
        let state = *self.state.read().unwrap();
        match state {
            CircuitState::Closed => Duration::ZERO,
            CircuitState::Open | CircuitState::HalfOpen => self
                .opened_at
                .read()
                .unwrap()
                .map(|t| t.elapsed())
                .unwrap_or(Duration::ZERO),
        }
    }
}

/// Statistics about a circuit breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub context: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub total_requests: u64,
    pub total_rejected: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub time_in_state_secs: u64,
    pub last_failure_at: Option<String>,
    pub last_success_at: Option<String>,
}
