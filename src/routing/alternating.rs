//! Alternating local/random-worker routing.

use rand::Rng;

use crate::routing::{Route, RoutingPolicy};

/// Every even-numbered connection goes to a randomly chosen worker; the rest
/// stay local.
#[derive(Debug, Default, Clone, Copy)]
pub struct Alternating;

impl Alternating {
    pub fn new() -> Self {
        Self
    }
}

impl RoutingPolicy for Alternating {
    fn route(&self, ordinal: u64, workers: usize) -> Route {
        if workers == 0 || ordinal % 2 != 0 {
            return Route::Local;
        }
        Route::Worker(rand::thread_rng().gen_range(0..workers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alternating() {
        let policy = Alternating::new();
        for ordinal in 1..=200u64 {
            match policy.route(ordinal, 2) {
                Route::Local => assert_eq!(ordinal % 2, 1),
                Route::Worker(i) => {
                    assert_eq!(ordinal % 2, 0);
                    assert!(i < 2);
                }
            }
        }
    }

    #[test]
    fn no_workers_means_local() {
        let policy = Alternating::new();
        assert_eq!(policy.route(2, 0), Route::Local);
    }
}
