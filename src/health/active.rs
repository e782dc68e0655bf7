//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe backends
//! - Update down, load and under-load state from the results
//! - Drain the backpressure queue once per tick, even with probing disabled

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, Uri};
use futures_util::future::join_all;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time;

use crate::config::{HealthCheckConfig, LoadSource};
use crate::health::pressure::LocalPressure;
use crate::load_balancer::{Backend, BackendManager};
use crate::observability::metrics;

/// Largest health payload read.
const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// Health payload: CPU and memory usage in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct LoadReport {
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub memory: f64,
}

impl LoadReport {
    /// `(cpu, memory)` as fractions in `[0, 1]`.
    pub fn fractions(&self) -> (f64, f64) {
        (
            (self.cpu / 100.0).clamp(0.0, 1.0),
            (self.memory / 100.0).clamp(0.0, 1.0),
        )
    }
}

/// Why a probe failed. Never propagated past the monitor.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid probe uri: {0}")]
    InvalidUri(String),

    #[error("connection error: {0}")]
    Connect(String),

    #[error("probe timed out")]
    Timeout,

    #[error("non-success status {0}")]
    Status(StatusCode),

    #[error("failed to read body: {0}")]
    Body(String),

    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

pub struct HealthMonitor {
    manager: Arc<BackendManager>,
    config: HealthCheckConfig,
    client: Client<HttpConnector, Body>,
    local: Option<Mutex<LocalPressure>>,
}

impl HealthMonitor {
    pub fn new(manager: Arc<BackendManager>, config: HealthCheckConfig) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        let local = match config.load_source {
            LoadSource::Local => Some(Mutex::new(LocalPressure::new())),
            LoadSource::Reported => None,
        };

        Self {
            manager,
            config,
            client,
            local,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let probing = self.config.enabled;
        if probing {
            tracing::info!(
                interval_ms = self.config.interval_ms,
                path = %self.config.path,
                load_source = ?self.config.load_source,
                "Health monitor starting"
            );
        } else {
            tracing::info!(
                interval_ms = self.config.interval_ms,
                "Active health checks disabled, draining queue only"
            );
        }

        let mut ticker = time::interval(Duration::from_millis(self.config.interval_ms));
        let report_every = Duration::from_secs(self.config.report_interval_secs);
        let mut reporter = time::interval_at(time::Instant::now() + report_every, report_every);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if probing {
                        self.tick().await;
                    } else {
                        self.manager.drain_queue();
                    }
                }
                _ = reporter.tick() => {
                    self.report();
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Probe everything, apply the results, then drain the queue.
    pub async fn tick(&self) {
        let members = self.manager.registry().all();
        let results = join_all(members.iter().map(|backend| self.probe(backend))).await;

        let local = self.local.as_ref().map(|pressure| {
            pressure
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .sample()
        });

        for (backend, result) in members.iter().zip(results) {
            self.apply(backend, result, local);
        }

        self.manager.drain_queue();
    }

    /// Probe one backend's health path within the configured timeout.
    pub async fn probe(&self, backend: &Backend) -> Result<LoadReport, ProbeError> {
        let url = backend
            .base_url()
            .join(&self.config.path)
            .map_err(|e| ProbeError::InvalidUri(e.to_string()))?;
        let uri: Uri = url
            .as_str()
            .parse()
            .map_err(|e: axum::http::uri::InvalidUri| ProbeError::InvalidUri(e.to_string()))?;
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .header("user-agent", "rampart-health-check")
            .body(Body::empty())
            .map_err(|e| ProbeError::InvalidUri(e.to_string()))?;

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| ProbeError::Connect(e.to_string()))?;
            if response.status() != StatusCode::OK {
                return Err(ProbeError::Status(response.status()));
            }
            let bytes = axum::body::to_bytes(Body::new(response.into_body()), MAX_PAYLOAD_BYTES)
                .await
                .map_err(|e| ProbeError::Body(e.to_string()))?;
            Ok::<LoadReport, ProbeError>(serde_json::from_slice(&bytes)?)
        };

        time::timeout(Duration::from_millis(self.config.timeout_ms), exchange)
            .await
            .map_err(|_| ProbeError::Timeout)?
    }

    /// Fold one probe result into backend state.
    ///
    /// `local` is the host's `(cpu, memory)` when load comes from the balancer
    /// itself; otherwise the backend's own report decides under-load.
    pub fn apply(
        &self,
        backend: &Backend,
        result: Result<LoadReport, ProbeError>,
        local: Option<(f64, f64)>,
    ) {
        let addr = backend.address();
        match result {
            Ok(report) => {
                if backend.set_down(false) {
                    tracing::info!(backend = %addr, "Backend is healthy again");
                }
                let (cpu, memory) = report.fractions();
                self.manager.registry().record_load(backend, cpu, memory);
                let (cpu, memory) = local.unwrap_or((cpu, memory));
                self.update_pressure(backend, cpu, memory);
            }
            Err(e) => {
                if backend.set_down(true) {
                    tracing::warn!(backend = %addr, error = %e, "Backend marked down");
                } else {
                    tracing::debug!(backend = %addr, error = %e, "Backend still down");
                }
                if let Some((cpu, memory)) = local {
                    self.update_pressure(backend, cpu, memory);
                }
            }
        }

        metrics::record_backend_health(&addr, !backend.is_down());
        metrics::record_backend_connections(&addr, backend.connections());
    }

    fn update_pressure(&self, backend: &Backend, cpu: f64, memory: f64) {
        let threshold = self.config.load_threshold;
        let over = cpu > threshold || memory > threshold;
        if backend.set_under_load(over) {
            if over {
                tracing::warn!(
                    backend = %backend.address(),
                    cpu_pct = cpu * 100.0,
                    memory_pct = memory * 100.0,
                    "Backend under high load"
                );
            } else {
                tracing::info!(backend = %backend.address(), "Backend load back to normal");
            }
        }
    }

    fn report(&self) {
        let stats = self.manager.registry().stats();
        tracing::info!(
            total = stats.total_backends,
            active = stats.active_servers,
            under_load = stats.servers_under_load,
            limited = stats.limited_servers,
            eligible = stats.eligible_servers,
            connections = stats.total_connections,
            queued = self.manager.queue_len(),
            "Health report"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, LoadBalancerConfig};
    use crate::load_balancer::{Dispatch, SelectionContext};
    use axum::{routing::get, Json, Router};
    use tokio::net::TcpListener;

    fn monitor_for(ports: &[u16], config: HealthCheckConfig) -> HealthMonitor {
        let backends: Vec<BackendConfig> = ports
            .iter()
            .map(|port| BackendConfig {
                host: "127.0.0.1".into(),
                port: *port,
                weight: 1,
            })
            .collect();
        let manager = Arc::new(BackendManager::new(&LoadBalancerConfig::default(), &backends));
        HealthMonitor::new(manager, config)
    }

    async fn serve(router: Router) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    #[test]
    fn report_percentages_become_fractions() {
        let report = LoadReport { cpu: 50.0, memory: 250.0 };
        assert_eq!(report.fractions(), (0.5, 1.0));
        let parsed: LoadReport = serde_json::from_str(r#"{"cpu": 12.5}"#).unwrap();
        assert_eq!(parsed, LoadReport { cpu: 12.5, memory: 0.0 });
    }

    #[test]
    fn failures_mark_down_and_successes_restore() {
        let monitor = monitor_for(&[4001], HealthCheckConfig::default());
        let backend = monitor.manager.registry().all()[0].clone();

        monitor.apply(&backend, Err(ProbeError::Timeout), None);
        assert!(backend.is_down());
        assert!(!backend.is_eligible());

        monitor.apply(&backend, Ok(LoadReport { cpu: 40.0, memory: 60.0 }), None);
        assert!(!backend.is_down());
        assert!((backend.current_load() - 0.5).abs() < 1e-9);
        assert!(!backend.is_under_load());
    }

    #[test]
    fn reported_pressure_sets_under_load() {
        let monitor = monitor_for(&[4002], HealthCheckConfig::default());
        let backend = monitor.manager.registry().all()[0].clone();

        monitor.apply(&backend, Ok(LoadReport { cpu: 95.0, memory: 10.0 }), None);
        assert!(backend.is_under_load());
        assert!(!backend.is_eligible());

        monitor.apply(&backend, Ok(LoadReport { cpu: 20.0, memory: 10.0 }), None);
        assert!(!backend.is_under_load());
    }

    #[test]
    fn local_pressure_overrides_report() {
        let monitor = monitor_for(&[4003], HealthCheckConfig::default());
        let backend = monitor.manager.registry().all()[0].clone();
        monitor.apply(&backend, Ok(LoadReport { cpu: 95.0, memory: 95.0 }), Some((0.1, 0.1)));
        assert!(!backend.is_under_load());
        monitor.apply(&backend, Err(ProbeError::Timeout), Some((0.1, 0.9)));
        assert!(backend.is_under_load());
    }

    #[tokio::test]
    async fn probe_reads_payload_and_rejects_bad_bodies() {
        let healthy = serve(Router::new().route(
            "/health",
            get(|| async { Json(serde_json::json!({"cpu": 30.0, "memory": 50.0})) }),
        ))
        .await;
        let garbled = serve(Router::new().route("/health", get(|| async { "ok" }))).await;
        let failing = serve(Router::new().route(
            "/health",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "busy") }),
        ))
        .await;

        let monitor = monitor_for(&[healthy, garbled, failing], HealthCheckConfig::default());
        let members = monitor.manager.registry().all();

        let report = monitor.probe(&members[0]).await.unwrap();
        assert_eq!(report, LoadReport { cpu: 30.0, memory: 50.0 });
        assert!(matches!(monitor.probe(&members[1]).await, Err(ProbeError::Payload(_))));
        assert!(matches!(
            monitor.probe(&members[2]).await,
            Err(ProbeError::Status(StatusCode::SERVICE_UNAVAILABLE))
        ));
    }

    #[tokio::test]
    async fn unreachable_backend_is_isolated() {
        let healthy = serve(Router::new().route(
            "/health",
            get(|| async { Json(serde_json::json!({"cpu": 1.0, "memory": 1.0})) }),
        ))
        .await;
        // bind then drop to get a port nobody listens on
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let monitor = monitor_for(&[closed, healthy], HealthCheckConfig::default());
        monitor.tick().await;
        let members = monitor.manager.registry().all();
        assert!(members[0].is_down());
        assert!(!members[1].is_down());
    }

    #[tokio::test]
    async fn tick_drains_queued_requests() {
        let healthy = serve(Router::new().route(
            "/health",
            get(|| async { Json(serde_json::json!({"cpu": 1.0, "memory": 1.0})) }),
        ))
        .await;
        let monitor = monitor_for(&[healthy], HealthCheckConfig::default());
        let backend = monitor.manager.registry().all()[0].clone();
        backend.set_down(true);

        let ctx = SelectionContext::from_ip("192.0.2.1".parse().unwrap());
        let Dispatch::Queued(ticket) = monitor.manager.dispatch(ctx) else {
            panic!("expected the request to queue");
        };
        monitor.tick().await;
        let guard = ticket.wait().await.unwrap();
        assert_eq!(guard.port(), healthy);
    }

    #[tokio::test]
    async fn disabled_probing_still_drains_queue() {
        let config = LoadBalancerConfig {
            backend_rate_limit: 1,
            backend_recovery_ms: 50,
            ..LoadBalancerConfig::default()
        };
        let backends = [BackendConfig {
            host: "127.0.0.1".into(),
            port: 4010,
            weight: 1,
        }];
        let manager = Arc::new(BackendManager::new(&config, &backends));
        let monitor = HealthMonitor::new(
            manager.clone(),
            HealthCheckConfig {
                enabled: false,
                interval_ms: 20,
                ..HealthCheckConfig::default()
            },
        );
        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(monitor.run(rx));

        let ctx = || SelectionContext::from_ip("192.0.2.1".parse().unwrap());
        assert!(matches!(manager.dispatch(ctx()), Dispatch::Ready(_)));
        let Dispatch::Queued(ticket) = manager.dispatch(ctx()) else {
            panic!("second request trips the backend window and must queue");
        };

        let guard = time::timeout(Duration::from_secs(2), ticket.wait())
            .await
            .expect("queued request dispatched after the cooldown")
            .unwrap();
        assert_eq!(guard.port(), 4010);
        assert_eq!(manager.queue_len(), 0);
        assert!(!task.is_finished());

        tx.send(()).unwrap();
        task.await.unwrap();
    }
}
