//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntax and the algorithm enum)
//! - Validate value ranges (limits > 0, ports valid, ladder increasing)
//! - Check that TLS files and geo CIDRs are usable
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Validation is a pure function: RampartConfig → Result<(), Vec<ValidationError>>

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{RampartConfig, PLACEHOLDER_API_KEY};
use crate::security::geo::Cidr;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("at least one backend is required")]
    NoBackends,

    #[error("backend {index}: host must not be empty")]
    EmptyHost { index: usize },

    #[error("backend {index}: port must be non-zero")]
    ZeroPort { index: usize },

    #[error("backend {index}: weight must be positive")]
    ZeroWeight { index: usize },

    #[error("backend {address} is listed more than once")]
    DuplicateBackend { address: String },

    #[error("{field}: invalid socket address {value:?}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("rate_limit.ban_durations_secs must be non-empty and non-decreasing")]
    InvalidBanLadder,

    #[error("health_check.timeout_ms ({timeout_ms}) must not exceed interval_ms ({interval_ms})")]
    TimeoutExceedsInterval { timeout_ms: u64, interval_ms: u64 },

    #[error("health_check.load_threshold must be within (0, 1]")]
    InvalidLoadThreshold,

    #[error("listener.tls.{field} must not be empty")]
    MissingTlsPath { field: &'static str },

    #[error("geo.table[{index}]: invalid CIDR {value:?}")]
    InvalidCidr { index: usize, value: String },

    #[error("admin.api_key must be changed when the admin API is enabled")]
    PlaceholderApiKey,
}

/// Validate a parsed configuration.
pub fn validate_config(config: &RampartConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_address(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if let Some(tls) = &config.listener.tls {
        check_address(&mut errors, "listener.tls.bind_address", &tls.bind_address);
        if tls.cert_path.trim().is_empty() {
            errors.push(ValidationError::MissingTlsPath { field: "cert_path" });
        }
        if tls.key_path.trim().is_empty() {
            errors.push(ValidationError::MissingTlsPath { field: "key_path" });
        }
    }

    if config.backends.is_empty() {
        errors.push(ValidationError::NoBackends);
    }
    let mut seen = std::collections::HashSet::new();
    for (index, backend) in config.backends.iter().enumerate() {
        if backend.normalized_host().is_empty() {
            errors.push(ValidationError::EmptyHost { index });
        }
        if backend.port == 0 {
            errors.push(ValidationError::ZeroPort { index });
        }
        if backend.weight == 0 {
            errors.push(ValidationError::ZeroWeight { index });
        }
        let address = format!("{}:{}", backend.normalized_host(), backend.port);
        if !seen.insert(address.clone()) {
            errors.push(ValidationError::DuplicateBackend { address });
        }
    }

    let lb = &config.load_balancer;
    positive(&mut errors, "load_balancer.virtual_nodes", lb.virtual_nodes as u64);
    positive(&mut errors, "load_balancer.backend_rate_limit", lb.backend_rate_limit.into());
    positive(&mut errors, "load_balancer.backend_window_ms", lb.backend_window_ms);
    positive(&mut errors, "load_balancer.backend_recovery_ms", lb.backend_recovery_ms);

    let rl = &config.rate_limit;
    positive(&mut errors, "rate_limit.window_ms", rl.window_ms);
    positive(&mut errors, "rate_limit.ip_limit", rl.ip_limit.into());
    positive(&mut errors, "rate_limit.sweep_interval_secs", rl.sweep_interval_secs);
    if rl.ban_durations_secs.is_empty()
        || rl.ban_durations_secs.windows(2).any(|pair| pair[1] < pair[0])
    {
        errors.push(ValidationError::InvalidBanLadder);
    }

    let ddos = &config.ddos;
    positive(&mut errors, "ddos.threshold", ddos.threshold);
    positive(&mut errors, "ddos.pattern_ttl_secs", ddos.pattern_ttl_secs);
    positive(&mut errors, "ddos.pattern_idle_secs", ddos.pattern_idle_secs);
    positive(&mut errors, "ddos.geo_ttl_secs", ddos.geo_ttl_secs);
    if !(ddos.geo_distance_km > 0.0) {
        errors.push(ValidationError::NotPositive { field: "ddos.geo_distance_km" });
    }
    if !(ddos.pattern_max_stddev > 0.0) {
        errors.push(ValidationError::NotPositive { field: "ddos.pattern_max_stddev" });
    }

    for (index, entry) in config.geo.table.iter().enumerate() {
        if entry.cidr.parse::<Cidr>().is_err() {
            errors.push(ValidationError::InvalidCidr {
                index,
                value: entry.cidr.clone(),
            });
        }
    }

    let hc = &config.health_check;
    positive(&mut errors, "health_check.interval_ms", hc.interval_ms);
    positive(&mut errors, "health_check.timeout_ms", hc.timeout_ms);
    positive(&mut errors, "health_check.report_interval_secs", hc.report_interval_secs);
    if hc.timeout_ms > hc.interval_ms {
        errors.push(ValidationError::TimeoutExceedsInterval {
            timeout_ms: hc.timeout_ms,
            interval_ms: hc.interval_ms,
        });
    }
    if !(hc.load_threshold > 0.0 && hc.load_threshold <= 1.0) {
        errors.push(ValidationError::InvalidLoadThreshold);
    }

    positive(&mut errors, "timeouts.upstream_secs", config.timeouts.upstream_secs);
    positive(&mut errors, "timeouts.request_secs", config.timeouts.request_secs);

    if config.observability.metrics_enabled {
        check_address(&mut errors, "observability.metrics_address", &config.observability.metrics_address);
    }

    if config.admin.enabled {
        check_address(&mut errors, "admin.bind_address", &config.admin.bind_address);
        if config.admin.api_key.is_empty() || config.admin.api_key == PLACEHOLDER_API_KEY {
            errors.push(ValidationError::PlaceholderApiKey);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn positive(errors: &mut Vec<ValidationError>, field: &'static str, value: u64) {
    if value == 0 {
        errors.push(ValidationError::NotPositive { field });
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}
