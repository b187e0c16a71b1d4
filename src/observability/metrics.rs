//! Metrics collection and exposition.
//!
//! # Metrics
//! - `handoff_connections_accepted_total` (counter): accepted by the delegating listener
//! - `handoff_connections_local_total` (counter): handed to the local application
//! - `handoff_connections_delegated_total` (counter): forwarded, by worker
//! - `handoff_forward_failures_total` (counter): forwarding failures, by worker
//! - `handoff_connections_received_total` (counter): reconstructed in a worker
//! - `handoff_reconstruct_failures_total` (counter): tokens that could not be redeemed
//! - `handoff_worker_connect_attempts_total` (counter): control channel connect attempts, by worker
//!
//! # Design Decisions
//! - Every call is a no-op until [`init_metrics`] installs the recorder

use std::net::SocketAddr;

use metrics::counter;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape endpoint.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_accepted() {
    counter!("handoff_connections_accepted_total").increment(1);
}

pub fn record_local() {
    counter!("handoff_connections_local_total").increment(1);
}

pub fn record_delegated(worker: usize) {
    counter!("handoff_connections_delegated_total", "worker" => worker.to_string()).increment(1);
}

pub fn record_forward_failure(worker: usize) {
    counter!("handoff_forward_failures_total", "worker" => worker.to_string()).increment(1);
}

pub fn record_received() {
    counter!("handoff_connections_received_total").increment(1);
}

pub fn record_reconstruct_failure() {
    counter!("handoff_reconstruct_failures_total").increment(1);
}

pub fn record_connect_attempt(worker: usize) {
    counter!("handoff_worker_connect_attempts_total", "worker" => worker.to_string()).increment(1);
}
