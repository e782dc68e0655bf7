//! Least response time strategy.

use std::sync::Arc;

use crate::load_balancer::{backend::Backend, LoadBalancer, SelectionContext, SelectionError};

/// Picks the backend with the lowest EWMA response time.
///
/// Backends without a sample are scored at the mean of the tested backends,
/// so a fresh backend beats slower-than-average peers but not faster ones.
/// With no samples at all every backend ties and list order decides.
#[derive(Debug, Default)]
pub struct LeastResponseTime;

impl LeastResponseTime {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastResponseTime {
    fn next_server(
        &self,
        backends: &[Arc<Backend>],
        _ctx: &SelectionContext,
    ) -> Result<Arc<Backend>, SelectionError> {
        let samples: Vec<Option<f64>> = backends.iter().map(|b| b.average_response_time()).collect();
        let tested: Vec<f64> = samples.iter().flatten().copied().collect();
        let neutral = if tested.is_empty() {
            0.0
        } else {
            tested.iter().sum::<f64>() / tested.len() as f64
        };

        let mut best: Option<(usize, f64)> = None;
        for (index, sample) in samples.iter().enumerate() {
            let score = sample.unwrap_or(neutral);
            // strict less-than keeps the first of equal scores
            if best.map_or(true, |(_, s)| score < s) {
                best = Some((index, score));
            }
        }
        best.map(|(index, _)| backends[index].clone())
            .ok_or(SelectionError::NoServersAvailable)
    }
}
