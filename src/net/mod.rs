//! Network layer subsystem.
//!
//! Plain HTTP is served by `axum::serve` on a Tokio listener; HTTPS, when
//! configured, goes through `axum-server` with rustls (tls.rs).

pub mod tls;
