//! Per-backend rate limiting.
//!
//! A fixed window per backend. Tripping it marks the backend limited for a
//! fixed recovery delay; there is no escalation. The cooldown is a deadline
//! on the backend, checked lazily, so the backend becomes eligible again
//! without waiting for a probe. The window restarts at the deadline.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::load_balancer::backend::Backend;
use crate::security::rate_limit::RateWindow;

/// Fixed-window limiter keyed by backend address.
#[derive(Debug)]
pub struct BackendRateLimiter {
    windows: DashMap<String, RateWindow>,
    window: Duration,
    limit: u32,
    recovery: Duration,
}

impl BackendRateLimiter {
    pub fn new(limit: u32, window: Duration, recovery: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            window,
            limit,
            recovery,
        }
    }

    pub fn recovery(&self) -> Duration {
        self.recovery
    }

    /// Count one request to `backend`. Returns true if this request tripped
    /// the limit, in which case the backend is now limited.
    pub fn hit(&self, backend: &Backend) -> bool {
        self.hit_at(backend, Instant::now())
    }

    pub fn hit_at(&self, backend: &Backend, now: Instant) -> bool {
        let mut window = self
            .windows
            .entry(backend.address())
            .or_insert_with(|| RateWindow::new(now));
        let count = window.hit(now, self.window);
        if count <= self.limit {
            return false;
        }

        let until = backend.mark_limited(now, self.recovery);
        *window = RateWindow::starting(until);
        tracing::warn!(
            backend = %backend.address(),
            count,
            recovery_ms = self.recovery.as_millis() as u64,
            "Backend rate limit exceeded, cooling down"
        );
        true
    }

    /// Drop windows idle for more than twice the window length.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        let horizon = self.window * 2;
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.window_start()) <= horizon);
        before - self.windows.len()
    }
}
