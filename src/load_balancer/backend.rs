//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single upstream server (host, port, weight)
//! - Track active connections (for Least Connections LB)
//! - Hold availability flags (down, under load, limited)
//! - Track performance state (current load, EWMA response time)

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use url::Url;

/// Weight given to a new response-time sample.
pub const EWMA_SAMPLE_WEIGHT: f64 = 0.3;
/// Weight kept from the response-time history.
pub const EWMA_HISTORY_WEIGHT: f64 = 0.7;

/// Bit pattern marking "no response-time sample yet" (a NaN).
const UNSEEN: u64 = u64::MAX;

/// Rate-limit cooldown bookkeeping.
#[derive(Debug, Default, Clone, Copy)]
struct LimitState {
    until: Option<Instant>,
    last_limited: Option<Instant>,
}

/// A single backend server.
#[derive(Debug)]
pub struct Backend {
    host: String,
    port: u16,
    weight: u32,
    /// Pre-calculated base URL for forwarding and probing.
    base_url: Url,

    /// Number of currently active connections.
    active_connections: AtomicUsize,

    /// Health probe failing.
    down: AtomicBool,
    /// CPU or memory over threshold.
    under_load: AtomicBool,
    limit: Mutex<LimitState>,

    /// Normalized load in [0, 1], stored as f64 bits.
    current_load: AtomicU64,
    /// EWMA of response times in milliseconds, stored as f64 bits.
    response_time: AtomicU64,
}

impl Backend {
    /// Create a new backend with all flags clear and counters at zero.
    pub fn new(host: impl Into<String>, port: u16, weight: u32) -> Result<Self, url::ParseError> {
        let host = host.into();
        let base_url = Url::parse(&format!("http://{}:{}", host, port))?;
        Ok(Self {
            host,
            port,
            weight: weight.max(1),
            base_url,
            active_connections: AtomicUsize::new(0),
            down: AtomicBool::new(false),
            under_load: AtomicBool::new(false),
            limit: Mutex::new(LimitState::default()),
            current_load: AtomicU64::new(0f64.to_bits()),
            response_time: AtomicU64::new(UNSEEN),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `host:port`, the backend's identity.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    // --- Eligibility ---

    /// A backend is eligible iff it is not down, not limited and not under load.
    pub fn is_eligible(&self) -> bool {
        self.is_eligible_at(Instant::now())
    }

    pub fn is_eligible_at(&self, now: Instant) -> bool {
        !self.is_down() && !self.is_under_load() && !self.is_limited_at(now)
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }

    /// Set the down flag. Returns true if the flag changed.
    pub fn set_down(&self, down: bool) -> bool {
        self.down.swap(down, Ordering::AcqRel) != down
    }

    pub fn is_under_load(&self) -> bool {
        self.under_load.load(Ordering::Acquire)
    }

    /// Set the under-load flag. Returns true if the flag changed.
    pub fn set_under_load(&self, under_load: bool) -> bool {
        self.under_load.swap(under_load, Ordering::AcqRel) != under_load
    }

    pub fn is_limited(&self) -> bool {
        self.is_limited_at(Instant::now())
    }

    /// Cooldowns expire lazily: a limit whose deadline has passed no longer counts.
    pub fn is_limited_at(&self, now: Instant) -> bool {
        let limit = self.limit.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(limit.until, Some(until) if now < until)
    }

    /// Mark the backend limited for `recovery`. Returns the cooldown deadline.
    pub fn mark_limited(&self, now: Instant, recovery: Duration) -> Instant {
        let until = now + recovery;
        let mut limit = self.limit.lock().unwrap_or_else(PoisonError::into_inner);
        limit.until = Some(until);
        limit.last_limited = Some(now);
        until
    }

    /// When the backend was last marked limited, if ever.
    pub fn last_limited_time(&self) -> Option<Instant> {
        self.limit.lock().unwrap_or_else(PoisonError::into_inner).last_limited
    }

    // --- Connections ---

    /// Get the current number of active connections.
    pub fn connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Apply `delta` to the connection gauge, clamped at zero. Returns the new value.
    pub fn adjust_connections(&self, delta: isize) -> usize {
        let mut current = self.active_connections.load(Ordering::Relaxed);
        loop {
            let next = if delta.is_negative() {
                current.saturating_sub(delta.unsigned_abs())
            } else {
                current.saturating_add(delta as usize)
            };
            match self.active_connections.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Count a dispatched request and return a guard that releases it on drop.
    pub fn connect(self: &Arc<Self>) -> BackendConnectionGuard {
        self.adjust_connections(1);
        BackendConnectionGuard {
            backend: self.clone(),
        }
    }

    // --- Performance ---

    /// Normalized load from the last health probe.
    pub fn current_load(&self) -> f64 {
        f64::from_bits(self.current_load.load(Ordering::Acquire))
    }

    /// Set `current_load` to the mean of normalized CPU and memory usage.
    pub fn record_load(&self, cpu: f64, memory: f64) -> f64 {
        let load = ((cpu + memory) / 2.0).clamp(0.0, 1.0);
        self.current_load.store(load.to_bits(), Ordering::Release);
        load
    }

    /// EWMA response time in milliseconds, `None` until the first sample.
    pub fn average_response_time(&self) -> Option<f64> {
        match self.response_time.load(Ordering::Acquire) {
            UNSEEN => None,
            bits => Some(f64::from_bits(bits)),
        }
    }

    /// Fold a response-time sample (milliseconds) into the EWMA.
    /// The first sample initializes the average.
    pub fn record_response_time(&self, sample_ms: f64) -> f64 {
        let mut current_bits = self.response_time.load(Ordering::Acquire);
        loop {
            let next = if current_bits == UNSEEN {
                sample_ms
            } else {
                EWMA_HISTORY_WEIGHT * f64::from_bits(current_bits) + EWMA_SAMPLE_WEIGHT * sample_ms
            };
            match self.response_time.compare_exchange_weak(
                current_bits,
                next.to_bits(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => current_bits = actual,
            }
        }
    }
}

/// A RAII guard that manages the active connection count.
///
/// The decrement happens exactly once, whether the request completes,
/// fails, or the handler future is dropped because the client went away.
#[derive(Debug)]
pub struct BackendConnectionGuard {
    backend: Arc<Backend>,
}

impl BackendConnectionGuard {
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Record the response time of a completed request.
    pub fn complete(&self, elapsed: Duration) -> f64 {
        self.backend
            .record_response_time(elapsed.as_secs_f64() * 1000.0)
    }
}

impl Deref for BackendConnectionGuard {
    type Target = Backend;
    fn deref(&self) -> &Self::Target {
        &self.backend
    }
}

impl Drop for BackendConnectionGuard {
    fn drop(&mut self) {
        self.backend.adjust_connections(-1);
    }
}
