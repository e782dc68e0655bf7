//! Security subsystem: admission control.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → geo.rs (region blocking)
//!     → rate_limit.rs (per-IP window, ban escalation)
//!     → ddos.rs (user agent, signatures, volume, pattern, geo anomaly)
//!     → Pass to selection
//!
//! Selected backend:
//!     → backend_limit.rs (per-backend window, cooldown)
//! ```
//!
//! # Design Decisions
//! - Fail closed on a positive signal; store errors count as no signal
//! - Banned clients are refused before their window is touched
//! - Admission never mutates backend state

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::config::{GeoConfig, RampartConfig};
use crate::observability::metrics;
use crate::store::MemoryStore;

pub mod backend_limit;
pub mod ddos;
pub mod geo;
pub mod rate_limit;

use ddos::{AttackDetector, AttackSignal};
use geo::{CidrError, GeoLookup, RegionFilter, StaticGeoTable};
use rate_limit::{ClientRateLimiter, ClientVerdict};

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdmissionRejection {
    #[error("requests from region {country} are blocked")]
    RegionBlocked { country: String },

    #[error("rate limit exceeded")]
    RateLimited { retry_after: Duration },

    #[error("client is temporarily banned")]
    Banned { retry_after: Duration },

    #[error("request flagged as an attack")]
    Attack(AttackSignal),
}

impl AdmissionRejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RegionBlocked { .. } | Self::Attack(_) => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } | Self::Banned { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::RegionBlocked { .. } => "region",
            Self::RateLimited { .. } => "rate_limit",
            Self::Banned { .. } => "banned",
            Self::Attack(signal) => signal.label(),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } | Self::Banned { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

impl IntoResponse for AdmissionRejection {
    fn into_response(self) -> Response {
        let mut response = (self.status(), self.to_string()).into_response();
        if let Some(wait) = self.retry_after() {
            // round up so clients never retry early
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Errors building the admission layer from configuration.
#[derive(Debug, Error)]
pub enum AdmissionSetupError {
    #[error("invalid geo table: {0}")]
    Geo(#[from] CidrError),

    #[error("invalid attack signature: {0}")]
    Signature(#[from] regex::Error),
}

/// Everything consulted before a backend is picked.
#[derive(Debug)]
pub struct Admission {
    regions: ArcSwap<RegionFilter>,
    geo: Arc<StaticGeoTable>,
    clients: Option<ClientRateLimiter>,
    attacks: Option<AttackDetector>,
    store: Arc<MemoryStore>,
}

impl Admission {
    pub fn from_config(
        config: &RampartConfig,
        store: Arc<MemoryStore>,
    ) -> Result<Self, AdmissionSetupError> {
        let geo = Arc::new(StaticGeoTable::from_config(&config.geo.table)?);

        let clients = config.rate_limit.enabled.then(|| {
            ClientRateLimiter::new(
                config.rate_limit.ip_limit,
                Duration::from_millis(config.rate_limit.window_ms),
                config
                    .rate_limit
                    .ban_durations_secs
                    .iter()
                    .map(|s| Duration::from_secs(*s))
                    .collect(),
            )
        });

        let attacks = if config.ddos.enabled {
            let lookup: Arc<dyn GeoLookup> = geo.clone();
            Some(AttackDetector::new(&config.ddos, store.clone(), lookup)?)
        } else {
            None
        };

        Ok(Self {
            regions: ArcSwap::from_pointee(RegionFilter::new(&config.geo.blocked_regions)),
            geo,
            clients,
            attacks,
            store,
        })
    }

    pub fn clients(&self) -> Option<&ClientRateLimiter> {
        self.clients.as_ref()
    }

    /// Swap in a reloaded geo table and region blocklist.
    pub fn reload_geo(&self, config: &GeoConfig) -> Result<(), CidrError> {
        self.geo.replace(&config.table)?;
        self.regions.store(Arc::new(RegionFilter::new(&config.blocked_regions)));
        tracing::info!(
            entries = self.geo.len(),
            blocked_regions = config.blocked_regions.len(),
            "Geo table reloaded"
        );
        Ok(())
    }

    /// Admit or refuse one request.
    pub async fn check(
        &self,
        ip: IpAddr,
        path: &str,
        headers: &HeaderMap,
    ) -> Result<(), AdmissionRejection> {
        if let Some(country) = self.regions.load().blocked_country(self.geo.as_ref(), ip) {
            tracing::warn!(client = %ip, country = %country, "Blocked request from restricted region");
            return Err(AdmissionRejection::RegionBlocked { country });
        }

        if let Some(clients) = &self.clients {
            match clients.check(ip) {
                ClientVerdict::Allowed => {}
                ClientVerdict::Limited { duration } => {
                    return Err(AdmissionRejection::RateLimited {
                        retry_after: duration,
                    })
                }
                ClientVerdict::Banned { remaining } => {
                    tracing::debug!(client = %ip, remaining_secs = remaining.as_secs(), "Rejecting banned client");
                    return Err(AdmissionRejection::Banned {
                        retry_after: remaining,
                    });
                }
            }
        }

        if let Some(attacks) = &self.attacks {
            if let Some(signal) = attacks.inspect(ip, path, headers).await {
                return Err(AdmissionRejection::Attack(signal));
            }
        }
        Ok(())
    }

    /// Drop stale windows, expired bans and expired store entries.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    pub fn sweep_at(&self, now: Instant) {
        let (windows, bans) = self
            .clients
            .as_ref()
            .map(|c| c.sweep_at(now))
            .unwrap_or_default();
        let entries = self.store.sweep_at(now);
        tracing::debug!(windows, bans, entries, "Swept admission state");
    }
}

/// Middleware refusing requests that fail admission.
pub async fn admission_middleware(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(admission): State<Arc<Admission>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    let verdict = admission.check(addr.ip(), &path, request.headers()).await;
    match verdict {
        Ok(()) => next.run(request).await,
        Err(rejection) => {
            metrics::record_admission_rejection(rejection.reason());
            rejection.into_response()
        }
    }
}
