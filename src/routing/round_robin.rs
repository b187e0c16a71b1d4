//! Round-robin routing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::routing::{Route, RoutingPolicy};

/// Round-robin selector.
/// Delegates every connection, rotating through workers with an internal counter.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RoutingPolicy for RoundRobin {
    fn route(&self, _ordinal: u64, workers: usize) -> Route {
        if workers == 0 {
            return Route::Local;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % workers;
        Route::Worker(index)
    }
}
