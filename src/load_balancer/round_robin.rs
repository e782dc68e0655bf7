//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{backend::Backend, LoadBalancer, SelectionContext, SelectionError};

/// Round-robin selector.
///
/// The counter persists across calls and is taken modulo the length of the
/// list it is handed each time, so a shrinking or growing eligible set never
/// indexes out of bounds (fairness may skew across such changes).
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn next_server(
        &self,
        backends: &[Arc<Backend>],
        _ctx: &SelectionContext,
    ) -> Result<Arc<Backend>, SelectionError> {
        if backends.is_empty() {
            return Err(SelectionError::NoServersAvailable);
        }

        // fetch_add hands every concurrent caller its own slot
        let slot = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(backends[slot % backends.len()].clone())
    }
}
