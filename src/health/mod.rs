//! Health and load feedback loop.
//!
//! # Data Flow
//! ```text
//! Periodic timer (active.rs)
//!     → Probe every backend concurrently
//!     → isDown from probe outcome, currentLoad from the reported payload
//!     → isUnderLoad from the payload or pressure.rs (local host)
//!     → Drain the backpressure queue
//!
//! Report timer:
//!     → Log registry stats
//! ```
//!
//! # Design Decisions
//! - One backend's failing probe never delays or fails the others
//! - Transitions are logged on change only
//! - Eligibility may lag reality by up to one interval

pub mod active;
pub mod pressure;

pub use active::{HealthMonitor, LoadReport, ProbeError};
pub use pressure::LocalPressure;
