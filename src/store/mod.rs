//! Counter and key-value store used by admission control.
//!
//! # Data Flow
//! ```text
//! AttackDetector
//!     → incr("{ip}:{second}")          volume buckets
//!     → get_many(last 60 buckets)      per-minute sum
//!     → get/set("{ip}:pattern")        RequestPatternRecord (JSON)
//!     → get/set("{ip}:geo")            GeoRecord (JSON)
//! ```
//!
//! # Design Decisions
//! - The trait is object-safe so a remote store can replace the in-process one
//! - Every entry carries an expiry; expired entries read as absent
//! - Values are strings, counters are decimal strings

use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;

pub mod memory;

pub use memory::MemoryStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("value at {0} is not an integer")]
    NotAnInteger(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Atomic counters and expiring values keyed by string.
pub trait CounterStore: Send + Sync + std::fmt::Debug {
    /// Increment the counter at `key`, creating it with `ttl` if absent.
    /// Returns the new value.
    fn incr<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, Result<u64, StoreError>>;

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StoreError>>;

    /// Fetch several keys at once, in order.
    fn get_many<'a>(
        &'a self,
        keys: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Option<String>>, StoreError>>;

    /// Overwrite `key`, resetting its expiry to `ttl`.
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}
