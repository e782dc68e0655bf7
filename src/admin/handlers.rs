use axum::{extract::State, Json};
use serde::Serialize;

use crate::admin::AdminState;
use crate::load_balancer::RegistryStats;

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub algorithm: String,
}

#[derive(Debug, Serialize)]
pub struct BackendStatus {
    pub address: String,
    pub weight: u32,
    pub down: bool,
    pub under_load: bool,
    pub limited: bool,
    pub eligible: bool,
    pub active_connections: usize,
    pub current_load: f64,
    pub average_response_ms: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct BalancerStats {
    #[serde(flatten)]
    pub registry: RegistryStats,
    pub queued_requests: usize,
    pub tracked_clients: usize,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        uptime_secs: state.started.elapsed().as_secs(),
        algorithm: state.manager.algorithm().to_string(),
    })
}

pub async fn get_backends(State(state): State<AdminState>) -> Json<Vec<BackendStatus>> {
    let statuses = state
        .manager
        .registry()
        .all()
        .iter()
        .map(|b| BackendStatus {
            address: b.address(),
            weight: b.weight(),
            down: b.is_down(),
            under_load: b.is_under_load(),
            limited: b.is_limited(),
            eligible: b.is_eligible(),
            active_connections: b.connections(),
            current_load: b.current_load(),
            average_response_ms: b.average_response_time(),
        })
        .collect();
    Json(statuses)
}

pub async fn get_stats(State(state): State<AdminState>) -> Json<BalancerStats> {
    Json(BalancerStats {
        registry: state.manager.registry().stats(),
        queued_requests: state.manager.queue_len(),
        tracked_clients: state
            .admission
            .clients()
            .map(|c| c.tracked_clients())
            .unwrap_or_default(),
    })
}
