//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Json, Router};
use rampart::config::BackendConfig;
use rampart::{HttpServer, RampartConfig, Shutdown};
use serde_json::json;
use tokio::net::TcpListener;

/// A mock backend answering every path with its own name.
pub struct MockBackend {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
}

impl MockBackend {
    pub fn config(&self) -> BackendConfig {
        BackendConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            weight: 1,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Start a backend on an ephemeral port. `/health` reports the given load
/// percentages; everything else returns `name`.
pub async fn start_backend(name: &'static str, cpu: f64, memory: f64) -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = hits.clone();
    let app = Router::new()
        .route(
            "/health",
            get(move || async move { Json(json!({ "cpu": cpu, "memory": memory })) }),
        )
        .fallback(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                name
            }
        });

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    MockBackend { addr, hits }
}

/// A config with active checks off and the given backends.
pub fn config_for(backends: &[&MockBackend]) -> RampartConfig {
    let mut config = RampartConfig::default();
    config.health_check.enabled = false;
    config.backends = backends.iter().map(|b| b.config()).collect();
    config
}

/// Run a proxy on an ephemeral port. Returns its address and the shutdown handle.
pub async fn start_proxy(config: RampartConfig) -> (SocketAddr, Shutdown) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let server = HttpServer::new(config).unwrap();

    let stop = shutdown.clone();
    tokio::spawn(async move {
        let _ = server.run(listener, stop).await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    (addr, shutdown)
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent("Mozilla/5.0 (rampart tests)")
        .no_proxy()
        .build()
        .unwrap()
}
