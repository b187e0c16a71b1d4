//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Front and worker processes produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (handoff counters)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Worker index and pid are attached as fields, not baked into messages
//! - Metrics are cheap (atomic increments) and no-ops until a recorder is installed

pub mod logging;
pub mod metrics;
