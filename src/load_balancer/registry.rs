//! Backend registry.
//!
//! # Responsibilities
//! - Own the set of backends in registration order
//! - Compute the eligible subset per request
//! - Funnel mutations of live backend state
//!
//! # Design Decisions
//! - Membership is an `ArcSwap` snapshot: readers never lock
//! - Per-backend fields are atomics, so mutators need no registry lock
//! - Replacing membership keeps the live state of surviving backends

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::config::BackendConfig;
use crate::load_balancer::backend::Backend;

/// Aggregate view of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total_backends: usize,
    pub total_connections: usize,
    pub active_servers: usize,
    pub servers_under_load: usize,
    pub limited_servers: usize,
    pub eligible_servers: usize,
}

/// Owns the backend set and its live state.
#[derive(Debug)]
pub struct BackendRegistry {
    members: ArcSwap<Vec<Arc<Backend>>>,
}

impl BackendRegistry {
    /// Seed the registry from configuration. All flags start clear.
    pub fn register(configs: &[BackendConfig]) -> Self {
        Self {
            members: ArcSwap::from_pointee(build_members(configs, &[])),
        }
    }

    /// Build a registry from already constructed backends.
    pub fn from_backends(backends: Vec<Arc<Backend>>) -> Self {
        Self {
            members: ArcSwap::from_pointee(backends),
        }
    }

    /// Replace membership. Backends whose `host:port` survives keep their state.
    /// Returns true if membership changed.
    pub fn replace(&self, configs: &[BackendConfig]) -> bool {
        let current = self.members.load_full();
        let next = build_members(configs, &current);
        let changed = next.len() != current.len()
            || next
                .iter()
                .zip(current.iter())
                .any(|(a, b)| !Arc::ptr_eq(a, b));
        if changed {
            self.members.store(Arc::new(next));
        }
        changed
    }

    /// Snapshot of every registered backend, in registration order.
    pub fn all(&self) -> Arc<Vec<Arc<Backend>>> {
        self.members.load_full()
    }

    pub fn len(&self) -> usize {
        self.members.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.load().is_empty()
    }

    /// Eligible backends, preserving registration order.
    pub fn eligible(&self) -> Vec<Arc<Backend>> {
        self.eligible_at(Instant::now())
    }

    pub fn eligible_at(&self, now: Instant) -> Vec<Arc<Backend>> {
        self.members
            .load()
            .iter()
            .filter(|b| b.is_eligible_at(now))
            .cloned()
            .collect()
    }

    pub fn find(&self, host: &str, port: u16) -> Option<Arc<Backend>> {
        self.members
            .load()
            .iter()
            .find(|b| b.host() == host && b.port() == port)
            .cloned()
    }

    pub fn adjust_connections(&self, backend: &Backend, delta: isize) -> usize {
        backend.adjust_connections(delta)
    }

    pub fn record_response_time(&self, backend: &Backend, sample: Duration) -> f64 {
        let average = backend.record_response_time(sample.as_secs_f64() * 1000.0);
        tracing::debug!(backend = %backend.address(), average_ms = average, "Updated average response time");
        average
    }

    pub fn record_load(&self, backend: &Backend, cpu: f64, memory: f64) -> f64 {
        let load = backend.record_load(cpu, memory);
        tracing::debug!(backend = %backend.address(), load, "Updated backend load");
        load
    }

    pub fn stats(&self) -> RegistryStats {
        let now = Instant::now();
        let members = self.members.load();
        RegistryStats {
            total_backends: members.len(),
            total_connections: members.iter().map(|b| b.connections()).sum(),
            active_servers: members.iter().filter(|b| !b.is_down()).count(),
            servers_under_load: members.iter().filter(|b| b.is_under_load()).count(),
            limited_servers: members.iter().filter(|b| b.is_limited_at(now)).count(),
            eligible_servers: members.iter().filter(|b| b.is_eligible_at(now)).count(),
        }
    }
}

fn build_members(configs: &[BackendConfig], existing: &[Arc<Backend>]) -> Vec<Arc<Backend>> {
    let mut members = Vec::with_capacity(configs.len());
    for config in configs {
        let host = config.normalized_host();
        if let Some(kept) = existing
            .iter()
            .find(|b| b.host() == host && b.port() == config.port && b.weight() == config.weight.max(1))
        {
            members.push(kept.clone());
            continue;
        }
        match Backend::new(host, config.port, config.weight) {
            Ok(backend) => members.push(Arc::new(backend)),
            Err(e) => tracing::warn!(host = %config.host, port = config.port, error = %e, "Invalid backend address"),
        }
    }
    members
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(port: u16) -> BackendConfig {
        BackendConfig {
            host: "127.0.0.1".into(),
            port,
            weight: 1,
        }
    }

    #[test]
    fn eligible_preserves_registration_order() {
        let registry = BackendRegistry::register(&[config(3001), config(3002), config(3003)]);
        registry.all()[1].set_down(true);

        let ports: Vec<u16> = registry.eligible().iter().map(|b| b.port()).collect();
        assert_eq!(ports, vec![3001, 3003]);
    }

    #[test]
    fn replace_keeps_state_of_surviving_backends() {
        let registry = BackendRegistry::register(&[config(3001), config(3002)]);
        let survivor = registry.find("127.0.0.1", 3002).unwrap();
        survivor.adjust_connections(4);

        assert!(registry.replace(&[config(3002), config(3003)]));
        let kept = registry.find("127.0.0.1", 3002).unwrap();
        assert!(Arc::ptr_eq(&survivor, &kept));
        assert_eq!(kept.connections(), 4);
        assert!(registry.find("127.0.0.1", 3001).is_none());

        assert!(!registry.replace(&[config(3002), config(3003)]));
    }

    #[test]
    fn stats_count_flags() {
        let registry = BackendRegistry::register(&[config(3001), config(3002), config(3003)]);
        let all = registry.all();
        all[0].set_down(true);
        all[1].set_under_load(true);
        all[2].adjust_connections(2);

        let stats = registry.stats();
        assert_eq!(stats.total_backends, 3);
        assert_eq!(stats.active_servers, 2);
        assert_eq!(stats.servers_under_load, 1);
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.eligible_servers, 1);
    }
}
