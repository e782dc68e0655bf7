//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     broadcast → listeners stop accepting, in-flight requests finish
//!               → health monitor and sweep task exit
//! ```

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
