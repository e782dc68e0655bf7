//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Request admitted
//!     → pool.rs (BackendManager::dispatch)
//!     → registry.rs (eligible backends, registration order)
//!     → selector.rs (apply configured algorithm):
//!         - round_robin.rs, least_conn.rs, least_response.rs
//!         - weighted.rs (weighted / dynamic-weighted draws)
//!         - hashing.rs (ip-hash, url-hash, consistent hashing over hash_ring.rs)
//!     → backend.rs (connection guard)
//!     → or queue.rs when nothing is eligible
//! ```
//!
//! # Design Decisions
//! - Eligibility is recomputed per request, never cached
//! - Strategy errors degrade to round-robin instead of failing the request
//! - Backend state is atomics; membership and ring are swapped snapshots

use std::net::IpAddr;
use std::sync::Arc;

pub mod backend;
pub mod hash_ring;
pub mod hashing;
pub mod least_conn;
pub mod least_response;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod round_robin;
pub mod selector;
pub mod weighted;

pub use backend::{Backend, BackendConnectionGuard};
pub use pool::{BackendManager, Dispatch};
pub use registry::{BackendRegistry, RegistryStats};
pub use selector::{Algorithm, Selector};

/// Errors raised while picking a backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    /// Every backend is down, limited or under load.
    #[error("no servers available")]
    NoServersAvailable,

    /// Consistent hashing was asked for a key on an empty ring.
    #[error("hash ring is empty")]
    RingEmpty,

    /// The ring owner of the key is registered but not eligible.
    #[error("ring owner {0} is not eligible")]
    RingTargetIneligible(String),
}

/// Per-request inputs the strategies key on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionContext {
    pub client_ip: IpAddr,
    /// Host header, if any.
    pub host: Option<String>,
    pub path: String,
}

impl SelectionContext {
    pub fn new(client_ip: IpAddr, host: Option<String>, path: impl Into<String>) -> Self {
        Self {
            client_ip,
            host,
            path: path.into(),
        }
    }

    pub fn from_ip(client_ip: IpAddr) -> Self {
        Self::new(client_ip, None, "/")
    }
}

/// A server-selection strategy.
pub trait LoadBalancer: Send + Sync + std::fmt::Debug {
    /// Pick one of `backends`, which the caller has already filtered to the
    /// eligible set in registration order.
    fn next_server(
        &self,
        backends: &[Arc<Backend>],
        ctx: &SelectionContext,
    ) -> Result<Arc<Backend>, SelectionError>;
}
