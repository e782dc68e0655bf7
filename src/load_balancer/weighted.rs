//! Weighted random strategies.
//!
//! Both draw a uniform value in `[0, total)` and walk the list accumulating
//! weight until the draw falls inside a backend's band. They differ only in
//! where the weights come from: configuration, or live load.

use std::sync::Arc;

use rand::Rng;

use crate::load_balancer::{backend::Backend, LoadBalancer, SelectionContext, SelectionError};

/// Index of the band containing `draw`. Falls back to the first backend when
/// rounding pushes the draw past the last band.
pub fn pick_band(weights: &[f64], draw: f64) -> usize {
    let mut remaining = draw;
    for (index, weight) in weights.iter().enumerate() {
        if remaining < *weight {
            return index;
        }
        remaining -= weight;
    }
    0
}

fn draw_weighted(backends: &[Arc<Backend>], weights: &[f64]) -> Result<Arc<Backend>, SelectionError> {
    if backends.is_empty() {
        return Err(SelectionError::NoServersAvailable);
    }
    let total: f64 = weights.iter().sum();
    if !(total > 0.0) {
        return Ok(backends[0].clone());
    }
    let draw = rand::thread_rng().gen_range(0.0..total);
    Ok(backends[pick_band(weights, draw)].clone())
}

/// Weighted round-robin using configured weights.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin;

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for WeightedRoundRobin {
    fn next_server(
        &self,
        backends: &[Arc<Backend>],
        _ctx: &SelectionContext,
    ) -> Result<Arc<Backend>, SelectionError> {
        let weights: Vec<f64> = backends.iter().map(|b| f64::from(b.weight())).collect();
        draw_weighted(backends, &weights)
    }
}

/// Derive weights from live load: `1 - load / total_load`.
/// With zero total load every backend weighs the same.
pub fn dynamic_weights(loads: &[f64]) -> Vec<f64> {
    let total: f64 = loads.iter().sum();
    if total <= 0.0 {
        return vec![1.0; loads.len()];
    }
    let weights: Vec<f64> = loads.iter().map(|load| 1.0 - load / total).collect();
    // A single loaded backend would weigh zero; treat that as equal weights too.
    if weights.iter().sum::<f64>() <= 0.0 {
        return vec![1.0; loads.len()];
    }
    weights
}

/// Weighted draw where lightly loaded backends weigh more.
#[derive(Debug, Default)]
pub struct DynamicWeighted;

impl DynamicWeighted {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for DynamicWeighted {
    fn next_server(
        &self,
        backends: &[Arc<Backend>],
        _ctx: &SelectionContext,
    ) -> Result<Arc<Backend>, SelectionError> {
        let loads: Vec<f64> = backends.iter().map(|b| b.current_load()).collect();
        draw_weighted(backends, &dynamic_weights(&loads))
    }
}
