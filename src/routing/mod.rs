//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted connection (ordinal n)
//!     → RoutingPolicy::route(n, worker_count)
//!     → Route::Local        → returned from accept()
//!     → Route::Worker(i)    → forwarded to worker i
//! ```
//!
//! # Design Decisions
//! - The policy is a pure decision; the accept loop never changes when a
//!   policy is swapped
//! - Policies never see the socket itself, only its ordinal
//! - Out-of-range or unavailable workers fall back to local handling

pub mod alternating;
pub mod round_robin;

use std::sync::Arc;

use crate::config::RoutingPolicyKind;

pub use alternating::Alternating;
pub use round_robin::RoundRobin;

/// Where an accepted connection should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Hand back to the local application.
    Local,
    /// Delegate to the worker at this index.
    Worker(usize),
}

/// Decides, per accepted connection, between local handling and delegation.
pub trait RoutingPolicy: Send + Sync + std::fmt::Debug {
    /// `ordinal` starts at 1 and increases with every accepted connection.
    fn route(&self, ordinal: u64, workers: usize) -> Route;
}

/// Never delegates.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalOnly;

impl RoutingPolicy for LocalOnly {
    fn route(&self, _ordinal: u64, _workers: usize) -> Route {
        Route::Local
    }
}

/// Build one of the built-in policies.
pub fn from_kind(kind: RoutingPolicyKind) -> Arc<dyn RoutingPolicy> {
    match kind {
        RoutingPolicyKind::Alternating => Arc::new(Alternating::new()),
        RoutingPolicyKind::RoundRobin => Arc::new(RoundRobin::new()),
        RoutingPolicyKind::LocalOnly => Arc::new(LocalOnly),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_only_never_delegates() {
        let policy = from_kind(RoutingPolicyKind::LocalOnly);
        assert!((1..100).all(|n| policy.route(n, 4) == Route::Local));
    }
}
