//! Sliding-window rate limiting for gateway calls.
//!
//! Admission control counts request timestamps within a trailing window per
//! `(category, identifier)` pair. Entries older than the window are pruned
//! lazily on every check, so no background task is needed. The limiter is
//! purely in-memory and advisory per-process; it protects the backend from
//! call storms but is not a distributed limiter.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::RateCategory;

/// Sliding-window request limiter.
///
/// Category limits default to [`RateCategory::default_limit`] and can be
/// overridden per category at construction time.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    limits: HashMap<RateCategory, (u32, Duration)>,
    windows: Mutex<HashMap<(RateCategory, String), VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    /// Create a limiter with the default per-category limits.
    pub fn new() -> Self {
        let limits = RateCategory::ALL
            .iter()
            .map(|c| (*c, c.default_limit()))
            .collect();
        Self {
            limits,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Override the limit for one category.
    pub fn with_limit(mut self, category: RateCategory, max: u32, window: Duration) -> Self {
        self.limits.insert(category, (max, window));
        self
    }

    /// The `(max, window)` limit applied to a category.
    pub fn limit(&self, category: RateCategory) -> (u32, Duration) {
        self.limits
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.default_limit())
    }

    /// Check whether a request is admitted, recording it if so.
    ///
    /// Prunes timestamps older than the window, then admits and records the
    /// request if the remaining count is below the category maximum. A denied
    /// request is not recorded and does not extend the window.
    pub fn is_allowed(&self, category: RateCategory, identifier: &str) -> bool {
        let (max, window) = self.limit(category);
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        let entries = windows
            .entry((category, identifier.to_string()))
            .or_default();
        Self::prune(entries, now, window);

        if (entries.len() as u32) < max {
            entries.push_back(now);
            true
        } else {
            debug!(
                category = %category,
                identifier,
                max,
                "rate limit denied request"
            );
            false
        }
    }

    /// Requests still admissible in the current window.
    pub fn remaining(&self, category: RateCategory, identifier: &str) -> u32 {
        let (max, window) = self.limit(category);
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        match windows.get_mut(&(category, identifier.to_string())) {
            Some(entries) => {
                Self::prune(entries, now, window);
                max.saturating_sub(entries.len() as u32)
            }
            None => max,
        }
    }

    /// Time until the next request would be admitted.
    ///
    /// Zero when the window has capacity; otherwise the time until the oldest
    /// recorded timestamp leaves the window.
    pub fn retry_after(&self, category: RateCategory, identifier: &str) -> Duration {
        let (max, window) = self.limit(category);
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        match windows.get_mut(&(category, identifier.to_string())) {
            Some(entries) => {
                Self::prune(entries, now, window);
                if (entries.len() as u32) < max {
                    Duration::ZERO
                } else {
                    match entries.front() {
                        Some(oldest) => (*oldest + window).saturating_duration_since(now),
                        None => Duration::ZERO,
                    }
                }
            }
            None => Duration::ZERO,
        }
    }

    /// Clear all recorded timestamps for an identifier across categories.
    pub fn reset(&self, identifier: &str) {
        let mut windows = self.windows.lock().unwrap();
        windows.retain(|(_, id), _| id != identifier);
    }

    /// Clear every recorded timestamp.
    pub fn reset_all(&self) {
        let mut windows = self.windows.lock().unwrap();
        windows.clear();
    }

    fn prune(entries: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = entries.front() {
            if now.duration_since(*oldest) >= window {
                entries.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}
