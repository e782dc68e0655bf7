//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router and wire middleware (request id, tracing,
//!   deadline, admission)
//! - Serve plain HTTP, and HTTPS when configured
//! - Answer from the cache, or dispatch to a backend (possibly after queueing)
//! - Forward and record response time
//! - Run the health monitor and the periodic sweep alongside the listeners

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, Request, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::RampartConfig;
use crate::health::HealthMonitor;
use crate::http::cache::ResponseCache;
use crate::http::forward::Forwarder;
use crate::http::request::{propagate_request_id_layer, request_id, set_request_id_layer};
use crate::lifecycle::Shutdown;
use crate::load_balancer::queue::Ticket;
use crate::load_balancer::{BackendConnectionGuard, BackendManager, Dispatch, SelectionContext};
use crate::net::tls::load_tls_config;
use crate::observability::metrics;
use crate::security::{admission_middleware, Admission, AdmissionSetupError};
use crate::store::MemoryStore;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Admission(#[from] AdmissionSetupError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Application state injected into handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    pub manager: Arc<BackendManager>,
    pub forwarder: Forwarder,
    pub cache: Option<Arc<ResponseCache>>,
    pub queue_max_wait: Option<Duration>,
}

/// HTTP server for the load balancer.
pub struct HttpServer {
    router: Router,
    config: RampartConfig,
    manager: Arc<BackendManager>,
    admission: Arc<Admission>,
    cache: Option<Arc<ResponseCache>>,
}

impl HttpServer {
    pub fn new(config: RampartConfig) -> Result<Self, ServerError> {
        let manager = Arc::new(BackendManager::new(&config.load_balancer, &config.backends));
        let admission = Arc::new(Admission::from_config(&config, Arc::new(MemoryStore::new()))?);
        let cache = config
            .cache
            .enabled
            .then(|| Arc::new(ResponseCache::new(&config.cache)));

        let state = AppState {
            manager: manager.clone(),
            forwarder: Forwarder::new(Duration::from_secs(config.timeouts.upstream_secs)),
            cache: cache.clone(),
            queue_max_wait: config.queue.max_wait_secs.map(Duration::from_secs),
        };

        let router = Self::build_router(&config, state, admission.clone());
        Ok(Self {
            router,
            config,
            manager,
            admission,
            cache,
        })
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &RampartConfig, state: AppState, admission: Arc<Admission>) -> Router {
        Router::new()
            .route("/{*path}", any(proxy_handler))
            .route("/", any(proxy_handler))
            .layer(middleware::from_fn_with_state(admission, admission_middleware))
            .with_state(state)
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(propagate_request_id_layer())
            .layer(TraceLayer::new_for_http())
            .layer(set_request_id_layer())
    }

    pub fn manager(&self) -> &Arc<BackendManager> {
        &self.manager
    }

    pub fn admission(&self) -> &Arc<Admission> {
        &self.admission
    }

    pub fn config(&self) -> &RampartConfig {
        &self.config
    }

    /// Run the server until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let monitor = HealthMonitor::new(self.manager.clone(), self.config.health_check.clone());
        tokio::spawn(monitor.run(shutdown.subscribe()));

        tokio::spawn(sweep_loop(
            self.admission.clone(),
            self.manager.clone(),
            self.cache.clone(),
            Duration::from_secs(self.config.rate_limit.sweep_interval_secs),
            shutdown.subscribe(),
        ));

        if let Some(tls) = &self.config.listener.tls {
            let rustls = load_tls_config(tls.cert_path.as_ref(), tls.key_path.as_ref()).await?;
            let tls_addr: SocketAddr = tls.bind_address.parse().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid TLS bind address {}", tls.bind_address),
                )
            })?;
            let handle = axum_server::Handle::new();
            let grace = Duration::from_secs(self.config.timeouts.request_secs);
            let stop = shutdown.wait();
            let stopper = handle.clone();
            tokio::spawn(async move {
                stop.await;
                stopper.graceful_shutdown(Some(grace));
            });

            let app = self
                .router
                .clone()
                .into_make_service_with_connect_info::<SocketAddr>();
            tracing::info!(address = %tls_addr, "HTTPS server starting");
            tokio::spawn(async move {
                if let Err(e) = axum_server::bind_rustls(tls_addr, rustls)
                    .handle(handle)
                    .serve(app)
                    .await
                {
                    tracing::error!(error = %e, "HTTPS server failed");
                }
            });
        }

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.wait())
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Periodically drop stale admission state, backend windows and cache entries.
async fn sweep_loop(
    admission: Arc<Admission>,
    manager: Arc<BackendManager>,
    cache: Option<Arc<ResponseCache>>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                admission.sweep_at(now);
                manager.limiter().sweep_at(now);
                if let Some(cache) = &cache {
                    cache.sweep_at(now);
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

async fn wait_for_dispatch(
    ticket: Ticket<BackendConnectionGuard>,
    max_wait: Option<Duration>,
) -> Option<BackendConnectionGuard> {
    match max_wait {
        Some(limit) => tokio::time::timeout(limit, ticket.wait()).await.ok().flatten(),
        None => ticket.wait().await,
    }
}

/// Main proxy handler.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let start = Instant::now();
    let request_id = request_id(request.headers());
    let method = request.method().clone();
    let key = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    if let Some(hit) = state.cache.as_ref().and_then(|c| c.lookup(&method, &key)) {
        tracing::debug!(request_id = %request_id, key = %key, "Served from cache");
        metrics::record_request(method.as_str(), 200, "cache", start);
        return hit;
    }

    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().host().map(str::to_string));
    let ctx = SelectionContext::new(addr.ip(), host, request.uri().path());

    let guard = match state.manager.dispatch(ctx) {
        Dispatch::Ready(guard) => guard,
        Dispatch::Queued(ticket) => match wait_for_dispatch(ticket, state.queue_max_wait).await {
            Some(guard) => guard,
            None => {
                tracing::warn!(request_id = %request_id, "Gave up waiting for a backend");
                metrics::record_request(method.as_str(), 503, "none", start);
                return (StatusCode::SERVICE_UNAVAILABLE, "No servers available").into_response();
            }
        },
    };
    let backend_addr = guard.address();

    tracing::debug!(
        request_id = %request_id,
        method = %method,
        path = %key,
        backend = %backend_addr,
        "Proxying request"
    );

    let sent = Instant::now();
    let response = match state
        .forwarder
        .forward(request, &guard, addr.ip(), &request_id)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(request_id = %request_id, backend = %backend_addr, error = %e, "Upstream error");
            metrics::record_request(method.as_str(), e.status().as_u16(), &backend_addr, start);
            return e.into_response();
        }
    };
    state
        .manager
        .registry()
        .record_response_time(&guard, sent.elapsed());

    let status = response.status();
    metrics::record_request(method.as_str(), status.as_u16(), &backend_addr, start);

    match &state.cache {
        Some(cache) if cache.is_cacheable(&method, status, response.headers()) => {
            let (parts, body) = response.into_parts();
            match axum::body::to_bytes(body, cache.max_body_bytes()).await {
                Ok(bytes) => {
                    cache.store(key, parts.headers.clone(), bytes.clone());
                    Response::from_parts(parts, Body::from(bytes))
                }
                Err(e) => {
                    tracing::error!(request_id = %request_id, error = %e, "Failed to read upstream body");
                    (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response()
                }
            }
        }
        _ => response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use axum::extract::connect_info::MockConnectInfo;
    use tower::ServiceExt;

    #[test]
    fn builds_from_minimal_config() {
        let mut config = RampartConfig::default();
        config.backends.push(BackendConfig {
            host: "127.0.0.1".into(),
            port: 3000,
            weight: 1,
        });
        let server = HttpServer::new(config).unwrap();
        assert_eq!(server.manager().registry().len(), 1);
        assert!(server.admission().clients().is_some());
    }

    #[tokio::test]
    async fn queue_wait_gives_up_after_limit() {
        let mut config = RampartConfig::default();
        config.backends.push(BackendConfig {
            host: "127.0.0.1".into(),
            port: 3000,
            weight: 1,
        });
        let server = HttpServer::new(config).unwrap();
        let manager = server.manager().clone();
        manager.registry().all()[0].set_down(true);

        let ctx = SelectionContext::from_ip("192.0.2.1".parse().unwrap());
        let Dispatch::Queued(ticket) = manager.dispatch(ctx) else {
            panic!("expected queueing");
        };
        assert!(wait_for_dispatch(ticket, Some(Duration::from_millis(20))).await.is_none());

        // the abandoned entry is skipped on the next drain
        manager.registry().all()[0].set_down(false);
        let outcome = manager.drain_queue();
        assert_eq!((outcome.dispatched, outcome.abandoned), (0, 1));
    }

    #[tokio::test]
    async fn router_refuses_before_dispatch() {
        let mut config = RampartConfig::default();
        config.backends.push(BackendConfig {
            host: "127.0.0.1".into(),
            port: 3000,
            weight: 1,
        });
        let server = HttpServer::new(config).unwrap();
        let router = server
            .router
            .clone()
            .layer(MockConnectInfo(SocketAddr::from(([192, 0, 2, 9], 4000))));

        let request = Request::builder()
            .uri("/")
            .header(header::USER_AGENT, "python-requests/2.31")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(server.manager().registry().stats().total_connections, 0);
    }
}
