//! Durable progress marker of a job

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Progress of a job, persisted atomically as one record
///
/// `processed_index` is the count of combinations whose outcome has been
/// committed; combinations `[0, processed_index)` are done. `version` is
/// owned by the store: it is bumped on every successful save and checked
/// against the caller's expected version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub processed_index: u64,
    pub found_flights: u64,
    pub failed_combinations: u64,
    pub best_price: Option<f64>,
    pub version: u64,
    pub last_checkpoint_at: DateTime<Utc>,
}

impl Checkpoint {
    /// The checkpoint every job starts from: index 0, version 0
    pub fn initial() -> Self {
        Self {
            processed_index: 0,
            found_flights: 0,
            failed_combinations: 0,
            best_price: None,
            version: 0,
            last_checkpoint_at: Utc::now(),
        }
    }

    /// Fold a found price into `best_price`.
    ///
    /// Only a strictly lower price replaces the current best, so the first
    /// offer seen at a given price keeps its place.
    pub fn record_price(&mut self, price: f64) -> bool {
        match self.best_price {
            Some(best) if price >= best => false,
            _ => {
                self.best_price = Some(price);
                true
            }
        }
    }

    pub fn is_within(&self, total_combinations: u64) -> bool {
        self.processed_index <= total_combinations
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::initial()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_initial_checkpoint() {
        let cp = Checkpoint::initial();
        assert_eq!(cp.processed_index, 0);
        assert_eq!(cp.version, 0);
        assert!(cp.best_price.is_none());
        assert!(cp.is_within(0));
    }

    #[test]
    fn test_equal_price_does_not_replace() {
        let mut cp = Checkpoint::initial();
        assert!(cp.record_price(420.0));
        assert!(!cp.record_price(420.0));
        assert!(cp.record_price(399.5));
        assert_eq!(cp.best_price, Some(399.5));
    }

    proptest! {
        #[test]
        fn prop_best_price_is_running_minimum(prices in proptest::collection::vec(1.0f64..2000.0, 1..50)) {
            let mut cp = Checkpoint::initial();
            let mut previous: Option<f64> = None;
            for price in &prices {
                cp.record_price(*price);
                if let (Some(prev), Some(now)) = (previous, cp.best_price) {
                    prop_assert!(now <= prev);
                }
                previous = cp.best_price;
            }
            let min = prices.iter().cloned().fold(f64::INFINITY, f64::min);
            prop_assert_eq!(cp.best_price, Some(min));
        }
    }
}
