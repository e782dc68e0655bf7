//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → RampartConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//!
//! With --watch:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → backend membership swapped in the registry
//! ```
//!
//! # Design Decisions
//! - Only backend membership is hot-reloadable; other sections need a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, BackendConfig, CacheConfig, DdosConfig, GeoConfig, GeoEntryConfig,
    HealthCheckConfig, ListenerConfig, LoadBalancerConfig, LoadSource, ObservabilityConfig,
    QueueConfig, RampartConfig, RateLimitConfig, TimeoutConfig, TlsConfig,
};
pub use validation::ValidationError;
