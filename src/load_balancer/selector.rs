//! Selection engine.
//!
//! Dispatches to one of eight strategies and owns the fallback policy: any
//! strategy error degrades to round-robin over the same eligible set, and
//! the degradation is logged and counted.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::load_balancer::backend::Backend;
use crate::load_balancer::hash_ring::HashRing;
use crate::load_balancer::hashing::{ConsistentHash, IpHash, UrlHash};
use crate::load_balancer::least_conn::LeastConnections;
use crate::load_balancer::least_response::LeastResponseTime;
use crate::load_balancer::round_robin::RoundRobin;
use crate::load_balancer::weighted::{DynamicWeighted, WeightedRoundRobin};
use crate::load_balancer::{LoadBalancer, SelectionContext, SelectionError};
use crate::observability::metrics;

/// Server-selection algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    IpHash,
    ConsistentHashing,
    DynamicWeighted,
    LeastResponseTime,
    UrlHash,
}

impl Algorithm {
    pub const ALL: [Algorithm; 8] = [
        Algorithm::RoundRobin,
        Algorithm::WeightedRoundRobin,
        Algorithm::LeastConnections,
        Algorithm::IpHash,
        Algorithm::ConsistentHashing,
        Algorithm::DynamicWeighted,
        Algorithm::LeastResponseTime,
        Algorithm::UrlHash,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "round-robin",
            Algorithm::WeightedRoundRobin => "weighted-round-robin",
            Algorithm::LeastConnections => "least-connections",
            Algorithm::IpHash => "ip-hash",
            Algorithm::ConsistentHashing => "consistent-hashing",
            Algorithm::DynamicWeighted => "dynamic-weighted",
            Algorithm::LeastResponseTime => "least-response-time",
            Algorithm::UrlHash => "url-hash",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an algorithm name outside the supported set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported load balancing algorithm: {0}")]
pub struct UnknownAlgorithm(pub String);

impl FromStr for Algorithm {
    type Err = UnknownAlgorithm;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase().replace('_', "-");
        Algorithm::ALL
            .into_iter()
            .find(|a| a.as_str() == normalized || a.as_str().replace('-', "") == normalized)
            .ok_or_else(|| UnknownAlgorithm(value.to_string()))
    }
}

/// Holds one instance of every strategy; stateful ones keep their state
/// across calls regardless of which algorithm is active.
#[derive(Debug)]
pub struct Selector {
    round_robin: RoundRobin,
    weighted: WeightedRoundRobin,
    least_connections: LeastConnections,
    ip_hash: IpHash,
    consistent: ConsistentHash,
    dynamic: DynamicWeighted,
    least_response: LeastResponseTime,
    url_hash: UrlHash,
}

impl Selector {
    /// Create a selector whose ring covers `members`.
    pub fn new(members: &[Arc<Backend>], virtual_nodes: usize) -> Self {
        Self {
            round_robin: RoundRobin::new(),
            weighted: WeightedRoundRobin::new(),
            least_connections: LeastConnections::new(),
            ip_hash: IpHash,
            consistent: ConsistentHash::new(HashRing::build(members, virtual_nodes)),
            dynamic: DynamicWeighted::new(),
            least_response: LeastResponseTime::new(),
            url_hash: UrlHash,
        }
    }

    /// Rebuild the hash ring after a membership change.
    pub fn rebuild_ring(&self, members: &[Arc<Backend>]) {
        self.consistent.rebuild(members);
    }

    pub fn ring(&self) -> Arc<HashRing> {
        self.consistent.ring()
    }

    fn strategy(&self, algorithm: Algorithm) -> &dyn LoadBalancer {
        match algorithm {
            Algorithm::RoundRobin => &self.round_robin,
            Algorithm::WeightedRoundRobin => &self.weighted,
            Algorithm::LeastConnections => &self.least_connections,
            Algorithm::IpHash => &self.ip_hash,
            Algorithm::ConsistentHashing => &self.consistent,
            Algorithm::DynamicWeighted => &self.dynamic,
            Algorithm::LeastResponseTime => &self.least_response,
            Algorithm::UrlHash => &self.url_hash,
        }
    }

    /// Pick a backend from `eligible` with `algorithm`.
    ///
    /// An empty list is `NoServersAvailable` before any strategy runs.
    pub fn select(
        &self,
        algorithm: Algorithm,
        eligible: &[Arc<Backend>],
        ctx: &SelectionContext,
    ) -> Result<Arc<Backend>, SelectionError> {
        if eligible.is_empty() {
            return Err(SelectionError::NoServersAvailable);
        }

        match self.strategy(algorithm).next_server(eligible, ctx) {
            Ok(backend) => Ok(backend),
            Err(e) => {
                match &e {
                    SelectionError::RingTargetIneligible(owner) => tracing::debug!(
                        algorithm = %algorithm,
                        owner = %owner,
                        "Ring owner ineligible, using round-robin"
                    ),
                    _ => tracing::warn!(
                        algorithm = %algorithm,
                        error = %e,
                        "Selection degraded to round-robin"
                    ),
                }
                metrics::record_selection_fallback(algorithm.as_str());
                self.round_robin.next_server(eligible, ctx)
            }
        }
    }
}
