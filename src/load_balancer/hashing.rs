//! Hash-based strategies: ip-hash, url-hash and consistent hashing.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::load_balancer::backend::Backend;
use crate::load_balancer::hash_ring::{hash32, HashRing};
use crate::load_balancer::{LoadBalancer, SelectionContext, SelectionError};

fn modulo_pick(backends: &[Arc<Backend>], key: &str) -> Result<Arc<Backend>, SelectionError> {
    if backends.is_empty() {
        return Err(SelectionError::NoServersAvailable);
    }
    Ok(backends[hash32(key) as usize % backends.len()].clone())
}

/// `hash(client ip) mod len(eligible)`.
#[derive(Debug, Default)]
pub struct IpHash;

impl LoadBalancer for IpHash {
    fn next_server(
        &self,
        backends: &[Arc<Backend>],
        ctx: &SelectionContext,
    ) -> Result<Arc<Backend>, SelectionError> {
        modulo_pick(backends, &ctx.client_ip.to_string())
    }
}

/// `hash(host header + path) mod len(eligible)`.
#[derive(Debug, Default)]
pub struct UrlHash;

impl LoadBalancer for UrlHash {
    fn next_server(
        &self,
        backends: &[Arc<Backend>],
        ctx: &SelectionContext,
    ) -> Result<Arc<Backend>, SelectionError> {
        let key = format!("{}{}", ctx.host.as_deref().unwrap_or_default(), ctx.path);
        modulo_pick(backends, &key)
    }
}

/// Ring lookup keyed on the client IP.
///
/// The ring spans every registered backend, so the owner of a key may be
/// ineligible right now. That case is reported as
/// [`SelectionError::RingTargetIneligible`] and the engine falls back to
/// round-robin over the eligible set.
#[derive(Debug)]
pub struct ConsistentHash {
    ring: ArcSwap<HashRing>,
}

impl ConsistentHash {
    pub fn new(ring: HashRing) -> Self {
        Self {
            ring: ArcSwap::from_pointee(ring),
        }
    }

    /// Swap in a ring rebuilt over `members`.
    pub fn rebuild(&self, members: &[Arc<Backend>]) {
        let virtual_nodes = self.ring.load().virtual_nodes();
        self.ring.store(Arc::new(HashRing::build(members, virtual_nodes)));
    }

    pub fn ring(&self) -> Arc<HashRing> {
        self.ring.load_full()
    }
}

impl LoadBalancer for ConsistentHash {
    fn next_server(
        &self,
        backends: &[Arc<Backend>],
        ctx: &SelectionContext,
    ) -> Result<Arc<Backend>, SelectionError> {
        let owner = self.ring.load().lookup(&ctx.client_ip.to_string())?;
        if backends.iter().any(|b| Arc::ptr_eq(b, &owner)) {
            Ok(owner)
        } else {
            Err(SelectionError::RingTargetIneligible(owner.address()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::hash_ring::DEFAULT_VIRTUAL_NODES;

    fn backends() -> Vec<Arc<Backend>> {
        (0..4)
            .map(|i| Arc::new(Backend::new("127.0.0.1", 8080 + i, 1).unwrap()))
            .collect()
    }

    #[test]
    fn ip_hash_is_sticky() {
        let backends = backends();
        let ctx = SelectionContext::from_ip("203.0.113.9".parse().unwrap());
        let first = IpHash.next_server(&backends, &ctx).unwrap();
        for _ in 0..10 {
            assert!(Arc::ptr_eq(&first, &IpHash.next_server(&backends, &ctx).unwrap()));
        }
    }

    #[test]
    fn url_hash_keys_on_host_and_path() {
        let backends = backends();
        let mut ctx = SelectionContext::from_ip("203.0.113.9".parse().unwrap());
        ctx.host = Some("example.com".into());
        ctx.path = "/a".into();
        let picked = UrlHash.next_server(&backends, &ctx).unwrap();
        let expected = hash32("example.com/a") as usize % backends.len();
        assert_eq!(picked.port(), backends[expected].port());

        // a different client with the same url lands on the same backend
        ctx.client_ip = "198.51.100.1".parse().unwrap();
        assert_eq!(UrlHash.next_server(&backends, &ctx).unwrap().port(), picked.port());
    }

    #[test]
    fn consistent_hash_reports_ineligible_owner() {
        let all = backends();
        let ch = ConsistentHash::new(HashRing::build(&all, DEFAULT_VIRTUAL_NODES));
        let ctx = SelectionContext::from_ip("203.0.113.9".parse().unwrap());
        let owner = ch.next_server(&all, &ctx).unwrap();

        let without_owner: Vec<_> = all.iter().filter(|b| !Arc::ptr_eq(b, &owner)).cloned().collect();
        assert!(matches!(
            ch.next_server(&without_owner, &ctx),
            Err(SelectionError::RingTargetIneligible(_))
        ));
    }

    #[test]
    fn consistent_hash_empty_ring() {
        let ch = ConsistentHash::new(HashRing::new(DEFAULT_VIRTUAL_NODES));
        let ctx = SelectionContext::from_ip("203.0.113.9".parse().unwrap());
        assert!(matches!(ch.next_server(&backends(), &ctx), Err(SelectionError::RingEmpty)));
    }
}
