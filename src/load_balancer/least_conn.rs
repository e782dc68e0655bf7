//! Least Connections load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{backend::Backend, LoadBalancer, SelectionContext, SelectionError};

/// Least connections selector.
/// Selects the backend with the minimum number of active connections.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnections {
    fn next_server(
        &self,
        backends: &[Arc<Backend>],
        _ctx: &SelectionContext,
    ) -> Result<Arc<Backend>, SelectionError> {
        // min_by_key keeps the first of equal keys, so ties go to list order
        backends
            .iter()
            .min_by_key(|b| b.connections())
            .cloned()
            .ok_or(SelectionError::NoServersAvailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_least_conn() {
        let lb = LeastConnections::new();
        let ctx = SelectionContext::from_ip("10.0.0.1".parse().unwrap());
        let b1 = Arc::new(Backend::new("127.0.0.1", 8080, 1).unwrap());
        let b2 = Arc::new(Backend::new("127.0.0.1", 8081, 1).unwrap());

        b1.adjust_connections(1);
        let backends = vec![b1.clone(), b2.clone()];

        // b2 has 0 connections
        let s1 = lb.next_server(&backends, &ctx).unwrap();
        assert_eq!(s1.port(), b2.port());

        // now b2 has 2, b1 has 1
        b2.adjust_connections(2);
        let s2 = lb.next_server(&backends, &ctx).unwrap();
        assert_eq!(s2.port(), b1.port());
    }

    #[test]
    fn ties_go_to_first_in_list() {
        let lb = LeastConnections::new();
        let ctx = SelectionContext::from_ip("10.0.0.1".parse().unwrap());
        let backends: Vec<_> = (0..3)
            .map(|i| Arc::new(Backend::new("127.0.0.1", 8080 + i, 1).unwrap()))
            .collect();
        backends[0].adjust_connections(1);

        let picked = lb.next_server(&backends, &ctx).unwrap();
        assert_eq!(picked.port(), 8081);
        for b in &backends {
            assert!(picked.connections() <= b.connections());
        }
    }
}
