//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, middleware)
//!     → request.rs (request id)
//!     → security (admission middleware)
//!     → cache.rs (hit → respond)
//!     → load_balancer (dispatch, maybe queue)
//!     → forward.rs (rewrite, send upstream, stream back)
//! ```

pub mod cache;
pub mod forward;
pub mod request;
pub mod server;

pub use cache::ResponseCache;
pub use forward::{ForwardError, Forwarder};
pub use request::X_REQUEST_ID;
pub use server::{AppState, HttpServer, ServerError};
