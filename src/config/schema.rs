//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for both the
//! front process and its workers. All types derive Serde traits for
//! deserialization from config files.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::handoff::DEFAULT_BACKLOG;

/// Environment variable carrying a worker's assigned control port.
pub const PORT_ENV: &str = "PORT";

/// Environment variable carrying a worker's index among its siblings.
pub const WORKER_INDEX_ENV: &str = "HANDOFF_WORKER_INDEX";

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct HandoffConfig {
    /// Public listener (front process).
    pub listener: ListenerConfig,

    /// Worker processes launched by the front process.
    pub workers: WorkerPoolConfig,

    /// Local vs. delegated routing.
    pub routing: RoutingConfig,

    /// Control port listener (worker process).
    pub delegated: DelegatedConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Path to the worker executable.
    pub program: PathBuf,

    /// Extra arguments passed to every worker.
    pub args: Vec<String>,

    /// Number of workers to launch.
    pub count: usize,

    /// Control port range `[start, end)`; an ephemeral port is probed when unset.
    pub port_range: Option<PortRange>,

    /// Delay between control channel connection attempts in milliseconds.
    pub connect_retry_ms: u64,

    /// Kill workers when the front process dies (Linux only).
    pub die_with_parent: bool,
}

impl WorkerPoolConfig {
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("handoff-worker"),
            args: Vec::new(),
            count: 2,
            port_range: None,
            connect_retry_ms: 1000,
            die_with_parent: true,
        }
    }
}

/// Half-open port range.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

/// Routing configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub policy: RoutingPolicyKind,
}

/// Built-in routing policies.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicyKind {
    /// Every other connection goes to a random worker.
    #[default]
    Alternating,
    /// Every connection goes to the next worker in turn.
    RoundRobin,
    /// Nothing is delegated.
    LocalOnly,
}

/// Worker-side listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DelegatedConfig {
    /// Address the control port binds to.
    pub bind_ip: IpAddr,

    /// Control port; taken from `PORT` when unset.
    pub port: Option<u16>,

    /// Maximum reconstructed connections awaiting accept.
    pub backlog: usize,
}

impl Default for DelegatedConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::from([127, 0, 0, 1]),
            port: None,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
