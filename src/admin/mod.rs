//! Admin API.
//!
//! Read-only views of backend state and balancer statistics, served on a
//! separate listener behind a bearer token.

pub mod auth;
pub mod handlers;

use std::sync::Arc;
use std::time::Instant;

use axum::{middleware, routing::get, Router};

use crate::load_balancer::BackendManager;
use crate::security::Admission;

use self::auth::admin_auth_middleware;
use self::handlers::{get_backends, get_stats, get_status};

#[derive(Debug, Clone)]
pub struct AdminState {
    pub manager: Arc<BackendManager>,
    pub admission: Arc<Admission>,
    pub api_key: Arc<str>,
    pub started: Instant,
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/backends", get(get_backends))
        .route("/admin/stats", get(get_stats))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}
