//! Backend pool management.
//!
//! # Responsibilities
//! - Tie the registry, selection engine, backend limiter and queue together
//! - Hand out connection guards for dispatched requests
//! - Queue requests when nothing is eligible and drain them later

use std::time::Duration;

use crate::config::{BackendConfig, LoadBalancerConfig};
use crate::load_balancer::{
    backend::BackendConnectionGuard,
    queue::{BackpressureQueue, DrainOutcome, Ticket},
    registry::BackendRegistry,
    selector::{Algorithm, Selector},
    SelectionContext, SelectionError,
};
use crate::observability::metrics;
use crate::security::backend_limit::BackendRateLimiter;

/// How a request proceeds.
#[derive(Debug)]
pub enum Dispatch {
    /// A backend was picked and its connection counted.
    Ready(BackendConnectionGuard),
    /// Nothing eligible (or older requests are waiting); wait on the ticket.
    Queued(Ticket<BackendConnectionGuard>),
}

/// Manages backends and load balancing.
#[derive(Debug)]
pub struct BackendManager {
    registry: BackendRegistry,
    selector: Selector,
    algorithm: Algorithm,
    limiter: BackendRateLimiter,
    queue: BackpressureQueue<BackendConnectionGuard>,
}

impl BackendManager {
    /// Create a new backend manager from configuration.
    pub fn new(config: &LoadBalancerConfig, backends: &[BackendConfig]) -> Self {
        let registry = BackendRegistry::register(backends);
        let selector = Selector::new(&registry.all(), config.virtual_nodes);
        let limiter = BackendRateLimiter::new(
            config.backend_rate_limit,
            Duration::from_millis(config.backend_window_ms),
            Duration::from_millis(config.backend_recovery_ms),
        );
        tracing::info!(
            algorithm = %config.algorithm,
            backends = registry.len(),
            "Load balancer initialized"
        );
        Self {
            registry,
            selector,
            algorithm: config.algorithm,
            limiter,
            queue: BackpressureQueue::new(),
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn limiter(&self) -> &BackendRateLimiter {
        &self.limiter
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Replace backend membership and rebuild the ring if it changed.
    pub fn replace_backends(&self, backends: &[BackendConfig]) -> bool {
        let changed = self.registry.replace(backends);
        if changed {
            self.selector.rebuild_ring(&self.registry.all());
            tracing::info!(backends = self.registry.len(), "Backend membership updated");
        }
        changed
    }

    /// Select a backend and count the connection.
    ///
    /// A pick that trips its backend's rate window marks it limited and the
    /// selection is retried over what remains eligible.
    pub fn get(&self, ctx: &SelectionContext) -> Result<BackendConnectionGuard, SelectionError> {
        // each retry removes one backend, so this terminates
        for _ in 0..=self.registry.len() {
            let eligible = self.registry.eligible();
            let backend = self.selector.select(self.algorithm, &eligible, ctx)?;
            if self.limiter.hit(&backend) {
                continue;
            }
            return Ok(backend.connect());
        }
        Err(SelectionError::NoServersAvailable)
    }

    /// Dispatch now, or queue behind anything already waiting.
    ///
    /// Waiting requests are drained first, so a newcomer only goes straight
    /// through once everything ahead of it has a backend.
    pub fn dispatch(&self, ctx: SelectionContext) -> Dispatch {
        if !self.queue.is_empty() {
            self.drain_queue();
        }
        if self.queue.is_empty() {
            match self.get(&ctx) {
                Ok(guard) => return Dispatch::Ready(guard),
                Err(e) => {
                    tracing::warn!(client = %ctx.client_ip, error = %e, "No servers available, queueing request");
                }
            }
        }
        let ticket = self.queue.enqueue(ctx);
        metrics::record_queue_depth(self.queue.len());
        Dispatch::Queued(ticket)
    }

    /// Hand queued requests a backend, oldest first.
    pub fn drain_queue(&self) -> DrainOutcome {
        let outcome = self.queue.drain(|ctx| self.get(ctx));
        if outcome.dispatched > 0 || outcome.abandoned > 0 {
            tracing::info!(
                dispatched = outcome.dispatched,
                abandoned = outcome.abandoned,
                remaining = outcome.remaining,
                "Drained backpressure queue"
            );
        }
        metrics::record_queue_depth(outcome.remaining);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(algorithm: Algorithm, ports: &[u16]) -> BackendManager {
        let config = LoadBalancerConfig {
            algorithm,
            ..LoadBalancerConfig::default()
        };
        let backends: Vec<BackendConfig> = ports
            .iter()
            .map(|port| BackendConfig {
                host: "127.0.0.1".into(),
                port: *port,
                weight: 1,
            })
            .collect();
        BackendManager::new(&config, &backends)
    }

    fn ctx() -> SelectionContext {
        SelectionContext::from_ip("192.0.2.10".parse().unwrap())
    }

    #[test]
    fn round_robin_visits_each_backend_once_per_cycle() {
        let manager = manager(Algorithm::RoundRobin, &[3001, 3002, 3003]);
        let ports: Vec<u16> = (0..6).map(|_| manager.get(&ctx()).unwrap().port()).collect();
        assert_eq!(ports, vec![3001, 3002, 3003, 3001, 3002, 3003]);
    }

    #[test]
    fn guard_counts_connection_until_dropped() {
        let manager = manager(Algorithm::LeastConnections, &[3001, 3002]);
        let first = manager.get(&ctx()).unwrap();
        let second = manager.get(&ctx()).unwrap();
        assert_ne!(first.port(), second.port());
        assert_eq!(manager.registry().stats().total_connections, 2);
        drop(first);
        drop(second);
        assert_eq!(manager.registry().stats().total_connections, 0);
    }

    #[test]
    fn limited_backend_is_skipped() {
        let config = LoadBalancerConfig {
            algorithm: Algorithm::RoundRobin,
            backend_rate_limit: 1,
            ..LoadBalancerConfig::default()
        };
        let backends = vec![
            BackendConfig { host: "127.0.0.1".into(), port: 3001, weight: 1 },
            BackendConfig { host: "127.0.0.1".into(), port: 3002, weight: 1 },
        ];
        let manager = BackendManager::new(&config, &backends);

        assert_eq!(manager.get(&ctx()).unwrap().port(), 3001);
        assert_eq!(manager.get(&ctx()).unwrap().port(), 3002);
        // both windows are full now: each pick trips a limit
        assert!(matches!(manager.get(&ctx()), Err(SelectionError::NoServersAvailable)));
        assert_eq!(manager.registry().stats().limited_servers, 2);
    }

    #[test]
    fn queued_request_is_dispatched_before_newcomers() {
        let manager = manager(Algorithm::RoundRobin, &[3001]);
        let backend = manager.registry().all()[0].clone();
        backend.set_down(true);

        let Dispatch::Queued(mut early) = manager.dispatch(ctx()) else {
            panic!("expected queueing while the only backend is down");
        };
        let Dispatch::Queued(mut second) = manager.dispatch(ctx()) else {
            panic!("newcomer must not overtake the queue");
        };
        assert_eq!(manager.queue_len(), 2);

        // backend recovers before the next tick; the newcomer drains the
        // queue first and only then gets its own backend
        backend.set_down(false);
        let late = manager.dispatch(ctx());
        let served = [early.try_take(), second.try_take()];
        assert!(served.iter().all(Option::is_some));
        assert!(matches!(late, Dispatch::Ready(_)));
        assert_eq!(manager.queue_len(), 0);
        assert_eq!(manager.registry().stats().total_connections, 3);
    }

    #[test]
    fn replacing_members_rebuilds_ring() {
        let manager = manager(Algorithm::ConsistentHashing, &[3001, 3002]);
        let before = manager.selector().ring().len();
        assert!(manager.replace_backends(&[
            BackendConfig { host: "127.0.0.1".into(), port: 3001, weight: 1 },
            BackendConfig { host: "127.0.0.1".into(), port: 3002, weight: 1 },
            BackendConfig { host: "127.0.0.1".into(), port: 3003, weight: 1 },
        ]));
        assert!(manager.selector().ring().len() > before);
    }

    #[test]
    fn newcomer_drains_queue_after_cooldown() {
        let config = LoadBalancerConfig {
            algorithm: Algorithm::RoundRobin,
            backend_rate_limit: 1,
            backend_recovery_ms: 50,
            ..LoadBalancerConfig::default()
        };
        let backends = vec![BackendConfig { host: "127.0.0.1".into(), port: 3001, weight: 1 }];
        let manager = BackendManager::new(&config, &backends);

        assert!(matches!(manager.dispatch(ctx()), Dispatch::Ready(_)));
        let Dispatch::Queued(mut waiting) = manager.dispatch(ctx()) else {
            panic!("window is full, the request must queue");
        };
        assert!(waiting.try_take().is_none());

        std::thread::sleep(Duration::from_millis(60));
        // the waiting request is served first and takes the fresh window
        let newcomer = manager.dispatch(ctx());
        assert!(waiting.try_take().is_some());
        assert!(matches!(newcomer, Dispatch::Queued(_)));
        assert_eq!(manager.queue_len(), 1);
    }
}
