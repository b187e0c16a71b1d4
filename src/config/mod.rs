//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → HandoffConfig (validated, immutable)
//!     → CLI flags and worker environment override individual fields
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    DelegatedConfig, HandoffConfig, ListenerConfig, LogFormat, ObservabilityConfig, PortRange,
    RoutingConfig, RoutingPolicyKind, WorkerPoolConfig, PORT_ENV, WORKER_INDEX_ENV,
};
pub use validation::{validate_config, ValidationError};
