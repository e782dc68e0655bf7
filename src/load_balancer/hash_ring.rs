//! Consistent-hashing ring with virtual nodes.
//!
//! # Design Decisions
//! - Each backend owns `virtual_nodes` points at `hash("host:port-i")`
//! - Points live in a `BTreeMap`, so lookup is a first-at-or-after range query
//! - Membership tracks registration, not eligibility: a backend that is down
//!   keeps its points and reclaims the same keys when it recovers
//! - The ring is rebuilt wholesale on membership change, never patched

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::load_balancer::backend::Backend;
use crate::load_balancer::SelectionError;

/// Virtual points per backend unless configured otherwise.
pub const DEFAULT_VIRTUAL_NODES: usize = 100;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a followed by the murmur3 finalizer for better avalanche
/// on short, similar keys.
pub fn hash32(key: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in key.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85eb_ca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2_ae35);
    hash ^= hash >> 16;
    hash
}

/// Ordered mapping from ring position to backend.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    ring: BTreeMap<u32, Arc<Backend>>,
    virtual_nodes: usize,
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            ring: BTreeMap::new(),
            virtual_nodes,
        }
    }

    /// Build a ring over `backends`.
    pub fn build(backends: &[Arc<Backend>], virtual_nodes: usize) -> Self {
        let mut ring = Self::new(virtual_nodes);
        ring.rebuild(backends);
        ring
    }

    /// Clear and reinsert every virtual point.
    pub fn rebuild(&mut self, backends: &[Arc<Backend>]) {
        self.ring.clear();
        for backend in backends {
            let address = backend.address();
            for i in 0..self.virtual_nodes {
                self.ring
                    .insert(hash32(&format!("{}-{}", address, i)), backend.clone());
            }
        }
        tracing::debug!(
            backends = backends.len(),
            points = self.ring.len(),
            "Hash ring rebuilt"
        );
    }

    /// Backend owning the first point at or after `hash(key)`, wrapping around.
    pub fn lookup(&self, key: &str) -> Result<Arc<Backend>, SelectionError> {
        let hash = hash32(key);
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, backend)| backend.clone())
            .ok_or(SelectionError::RingEmpty)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backends(count: u16) -> Vec<Arc<Backend>> {
        (0..count)
            .map(|i| Arc::new(Backend::new("10.0.0.1", 9000 + i, 1).unwrap()))
            .collect()
    }

    fn keys() -> Vec<String> {
        (0..2000).map(|i| format!("192.168.{}.{}", i / 250, i % 250)).collect()
    }

    #[test]
    fn empty_ring_fails_lookup() {
        let ring = HashRing::new(DEFAULT_VIRTUAL_NODES);
        assert!(matches!(ring.lookup("1.2.3.4"), Err(SelectionError::RingEmpty)));
    }

    #[test]
    fn rebuild_without_membership_change_is_deterministic() {
        let members = backends(4);
        let first = HashRing::build(&members, DEFAULT_VIRTUAL_NODES);
        let mut second = HashRing::build(&members, DEFAULT_VIRTUAL_NODES);
        second.rebuild(&members);

        for key in keys() {
            let a = first.lookup(&key).unwrap();
            let b = second.lookup(&key).unwrap();
            assert!(Arc::ptr_eq(&a, &b), "key {} moved", key);
        }
    }

    #[test]
    fn adding_a_backend_moves_a_fraction_of_keys() {
        let mut members = backends(4);
        let before = HashRing::build(&members, DEFAULT_VIRTUAL_NODES);
        members.push(Arc::new(Backend::new("10.0.0.1", 9100, 1).unwrap()));
        let after = HashRing::build(&members, DEFAULT_VIRTUAL_NODES);

        let keys = keys();
        let moved = keys
            .iter()
            .filter(|k| before.lookup(k).unwrap().port() != after.lookup(k).unwrap().port())
            .count();
        let fraction = moved as f64 / keys.len() as f64;
        // Ideal is 1/5; anything near that, and far from "everything moved", is fine.
        assert!(fraction > 0.05 && fraction < 0.40, "moved fraction {}", fraction);

        // Keys that moved all went to the new backend.
        for key in &keys {
            let old = before.lookup(key).unwrap();
            let new = after.lookup(key).unwrap();
            if old.port() != new.port() {
                assert_eq!(new.port(), 9100);
            }
        }
    }

    #[test]
    fn ring_holds_points_for_every_backend() {
        let members = backends(3);
        let ring = HashRing::build(&members, 10);
        assert!(ring.len() <= 30 && ring.len() >= 28);
        assert_eq!(ring.virtual_nodes(), 10);
    }
}
