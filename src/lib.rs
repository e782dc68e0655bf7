//! Rampart: routing and admission control for an HTTP load balancer.

pub mod admin;
pub mod config;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod security;
pub mod store;

pub use config::schema::RampartConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
