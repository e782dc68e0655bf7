//! Rampart load balancer.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────▶ http server ──▶ admission ──▶ cache ──▶ backend manager ──▶ forward ──▶ Backend
//!              (request id,    (region,      (GET)     (select, limit,
//!               trace,          rate limit,             queue)
//!               deadline)       attack)
//!
//!     Background: health monitor, sweeper, config watcher, admin API, metrics
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;

use rampart::admin::{setup_admin_router, AdminState};
use rampart::config::{load_config, watcher::ConfigWatcher, RampartConfig};
use rampart::lifecycle::signals::shutdown_on_signal;
use rampart::observability::{logging, metrics};
use rampart::{HttpServer, Shutdown};

#[derive(Parser, Debug)]
#[command(name = "rampart", version, about = "HTTP load balancer with admission control")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Reload backend membership when the configuration file changes
    #[arg(long, requires = "config")]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => RampartConfig::default(),
    };

    logging::init(&config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rampart starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        algorithm = ?config.load_balancer.algorithm,
        backends = config.backends.len(),
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    let server = HttpServer::new(config.clone())?;

    if config.admin.enabled {
        let state = AdminState {
            manager: server.manager().clone(),
            admission: server.admission().clone(),
            api_key: Arc::from(config.admin.api_key.as_str()),
            started: Instant::now(),
        };
        let admin_listener = TcpListener::bind(&config.admin.bind_address).await?;
        tracing::info!(address = %admin_listener.local_addr()?, "Admin API listening");
        let app = setup_admin_router(state).into_make_service_with_connect_info::<SocketAddr>();
        let stop = shutdown.wait();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(admin_listener, app).with_graceful_shutdown(stop).await {
                tracing::error!(error = %e, "Admin server failed");
            }
        });
    }

    // dropping the watcher stops it, so it lives until main returns
    let _watcher = match (&args.config, args.watch) {
        (Some(path), true) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            let handle = watcher.run()?;
            tokio::spawn(rampart::config::watcher::apply_reloads(
                server.manager().clone(),
                server.admission().clone(),
                updates,
            ));
            Some(handle)
        }
        _ => None,
    };

    tokio::spawn(shutdown_on_signal(shutdown.clone()));
    server.run(listener, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
