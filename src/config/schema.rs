//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the balancer.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::load_balancer::hash_ring::DEFAULT_VIRTUAL_NODES;
use crate::load_balancer::Algorithm;

/// Root configuration for the load balancer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RampartConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// Selection algorithm and backend limits.
    pub load_balancer: LoadBalancerConfig,

    /// Backend server definitions.
    pub backends: Vec<BackendConfig>,

    /// Per-client rate limiting.
    pub rate_limit: RateLimitConfig,

    /// Attack heuristics.
    pub ddos: DdosConfig,

    /// Region blocking and the static geo table.
    pub geo: GeoConfig,

    /// Health check settings.
    pub health_check: HealthCheckConfig,

    /// Backpressure queue settings.
    pub queue: QueueConfig,

    /// Response cache settings.
    pub cache: CacheConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin API settings.
    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Plain HTTP bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional HTTPS listener; enabling it is the TLS toggle.
    pub tls: Option<TlsConfig>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
        }
    }
}

/// TLS configuration for the HTTPS listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// HTTPS bind address (e.g., "0.0.0.0:8443").
    pub bind_address: String,

    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Selection algorithm and per-backend rate limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub algorithm: Algorithm,

    /// Virtual ring points per backend for consistent hashing.
    pub virtual_nodes: usize,

    /// Requests per backend allowed inside one backend window.
    pub backend_rate_limit: u32,

    /// Backend window length in milliseconds.
    pub backend_window_ms: u64,

    /// Cooldown after a backend trips its limit, in milliseconds.
    pub backend_recovery_ms: u64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::RoundRobin,
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
            backend_rate_limit: 1000,
            backend_window_ms: 1000,
            backend_recovery_ms: 10_000,
        }
    }
}

/// Backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BackendConfig {
    /// Hostname or IP. A leading `http://` is tolerated and stripped.
    pub host: String,

    /// Backend port.
    pub port: u16,

    /// Weight for weighted load balancing (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl BackendConfig {
    pub fn normalized_host(&self) -> &str {
        let host = self.host.trim();
        host.strip_prefix("http://")
            .or_else(|| host.strip_prefix("https://"))
            .unwrap_or(host)
            .trim_end_matches('/')
    }
}

fn default_weight() -> u32 {
    1
}

/// Per-client rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable client rate limiting.
    pub enabled: bool,

    /// Window length in milliseconds.
    pub window_ms: u64,

    /// Requests allowed per client inside one window.
    pub ip_limit: u32,

    /// Ban escalation ladder in seconds, increasing.
    pub ban_durations_secs: Vec<u64>,

    /// How often stale windows, bans and store entries are swept.
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 60_000,
            ip_limit: 100,
            ban_durations_secs: vec![300, 1800, 86_400],
            sweep_interval_secs: 3600,
        }
    }
}

/// Attack heuristic configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DdosConfig {
    /// Enable attack heuristics.
    pub enabled: bool,

    /// Requests per IP per minute before the volume signal fires.
    pub threshold: u64,

    /// User-Agent substrings rejected outright (case-insensitive).
    pub blocked_user_agents: Vec<String>,

    /// Match the path and headers against injection signatures.
    pub signatures_enabled: bool,

    /// Sample count above which a sub-second interval is anomalous.
    pub pattern_burst_count: u64,

    /// Interval standard deviation (seconds) above which a client is anomalous.
    pub pattern_max_stddev: f64,

    /// Samples needed before the deviation check applies.
    pub pattern_min_samples: u64,

    /// TTL of request pattern records, in seconds.
    pub pattern_ttl_secs: u64,

    /// A gap longer than this, in seconds, ends a session: the interval
    /// histogram starts over and the gap itself is not sampled.
    pub pattern_idle_secs: u64,

    /// Distance between consecutive sightings that counts as relocation.
    pub geo_distance_km: f64,

    /// TTL of geo records, in seconds.
    pub geo_ttl_secs: u64,
}

impl Default for DdosConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 100,
            blocked_user_agents: vec![
                "curl".to_string(),
                "wget".to_string(),
                "python-requests".to_string(),
                "PostmanRuntime".to_string(),
            ],
            signatures_enabled: true,
            pattern_burst_count: 1000,
            pattern_max_stddev: 120.0,
            pattern_min_samples: 20,
            pattern_ttl_secs: 3600,
            pattern_idle_secs: 300,
            geo_distance_km: 5000.0,
            geo_ttl_secs: 86_400,
        }
    }
}

/// Region blocking and geo table.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GeoConfig {
    /// ISO country codes whose requests are refused.
    pub blocked_regions: Vec<String>,

    /// Static CIDR → location table used for lookups.
    pub table: Vec<GeoEntryConfig>,
}

/// One row of the static geo table.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct GeoEntryConfig {
    pub cidr: String,
    pub country: String,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
}

/// Where the under-load signal comes from.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoadSource {
    /// CPU/memory reported in each backend's health payload.
    #[default]
    Reported,
    /// CPU/memory of the host running the balancer.
    Local,
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    /// Health check interval in milliseconds.
    pub interval_ms: u64,

    /// Health check timeout in milliseconds.
    pub timeout_ms: u64,

    /// Path to probe for HTTP health checks.
    pub path: String,

    /// CPU or memory fraction above which a backend is under load.
    pub load_threshold: f64,

    pub load_source: LoadSource,

    /// Interval of the aggregate health report log, in seconds.
    pub report_interval_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
            timeout_ms: 2_000,
            path: "/health".to_string(),
            load_threshold: 0.8,
            load_source: LoadSource::Reported,
            report_interval_secs: 300,
        }
    }
}

/// Backpressure queue configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct QueueConfig {
    /// Give up on a queued request after this many seconds. Unset waits forever.
    pub max_wait_secs: Option<u64>,
}

/// Response cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    /// Default expiry of cached responses, in seconds.
    pub ttl_secs: u64,

    /// Largest response body that is cached.
    pub max_body_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: 3600,
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream request timeout in seconds.
    pub upstream_secs: u64,

    /// Overall request deadline, including time spent queued, in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            upstream_secs: 30,
            request_secs: 60,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

/// Placeholder key that validation refuses when the admin API is enabled.
pub const PLACEHOLDER_API_KEY: &str = "CHANGE_ME_IN_PRODUCTION";

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: PLACEHOLDER_API_KEY.to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_uses_defaults() {
        let config: RampartConfig = toml::from_str(
            r#"
            [[backends]]
            host = "http://10.0.0.5"
            port = 3000
            "#,
        )
        .unwrap();
        assert_eq!(config.load_balancer.algorithm, Algorithm::RoundRobin);
        assert_eq!(config.backends[0].weight, 1);
        assert_eq!(config.backends[0].normalized_host(), "10.0.0.5");
        assert_eq!(config.rate_limit.ban_durations_secs, vec![300, 1800, 86_400]);
    }

    #[test]
    fn algorithm_names_are_kebab_case() {
        let config: RampartConfig = toml::from_str(
            r#"
            [load_balancer]
            algorithm = "least-response-time"
            "#,
        )
        .unwrap();
        assert_eq!(config.load_balancer.algorithm, Algorithm::LeastResponseTime);

        let bad = toml::from_str::<RampartConfig>(
            r#"
            [load_balancer]
            algorithm = "fastest"
            "#,
        );
        assert!(bad.is_err());
    }
}
