//! Execution of a single search unit
//!
//! A unit is one combination. Every backend attempt first takes a token from
//! the rate limiter and is bounded by the unit timeout; transient failures
//! (including timeouts) are retried per the [`RetryPolicy`]. Offers that pass
//! the job's constraints compete on price and the cheapest one, first seen on
//! ties, becomes the unit's result.

use crate::backend::{BackendError, FlightOffer, SearchBackend, SearchRequest};
use crate::rate_limit::RateLimiter;
use crate::retry::{retry_with_backoff, Classify, ErrorClass, RetryPolicy};
use farescan_store::{Combination, SearchConstraints};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Bucket name for backend searches
pub const SEARCH_BUCKET: &str = "search";

/// Why a unit produced no result
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UnitError {
    #[error("transient failure after {attempts} attempts: {message}")]
    Transient { attempts: u32, message: String },

    #[error("permanent failure: {0}")]
    Permanent(String),
}

/// What a unit came back with
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    /// The cheapest accepted offer
    Found(FlightOffer),
    /// The search worked but no offer passed the constraints
    NoMatch,
    Failed(UnitError),
}

/// Runs units against a backend
#[derive(Clone)]
pub struct SearchExecutor {
    backend: Arc<dyn SearchBackend>,
    rate_limiter: RateLimiter,
    retry: RetryPolicy,
    unit_timeout: Duration,
}

impl SearchExecutor {
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        rate_limiter: RateLimiter,
        retry: RetryPolicy,
        unit_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            rate_limiter,
            retry,
            unit_timeout,
        }
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub async fn execute(&self, combination: &Combination, constraints: &SearchConstraints) -> UnitOutcome {
        let request = SearchRequest::for_combination(combination, *constraints);
        let operation = request.key();
        let mut attempts = 0;

        let searched = retry_with_backoff(&self.retry, &operation, |_| {
            attempts += 1;
            self.attempt(&request)
        })
        .await;

        match searched {
            Ok(offers) => match cheapest_accepted(&offers, constraints) {
                Some(offer) => UnitOutcome::Found(offer.clone()),
                None => {
                    debug!(index = combination.index, offers = offers.len(), "No offer within constraints");
                    UnitOutcome::NoMatch
                }
            },
            Err(e) => match e.class() {
                ErrorClass::Permanent => UnitOutcome::Failed(UnitError::Permanent(e.to_string())),
                ErrorClass::Transient => UnitOutcome::Failed(UnitError::Transient {
                    attempts,
                    message: e.to_string(),
                }),
            },
        }
    }

    async fn attempt(&self, request: &SearchRequest) -> Result<Vec<FlightOffer>, BackendError> {
        self.rate_limiter.acquire(SEARCH_BUCKET).await;
        match tokio::time::timeout(self.unit_timeout, self.backend.search(request)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Transient(format!(
                "search timed out after {}s",
                self.unit_timeout.as_secs_f64()
            ))),
        }
    }
}

/// The cheapest offer passing `constraints`; the earliest wins on equal price.
pub fn cheapest_accepted<'a>(offers: &'a [FlightOffer], constraints: &SearchConstraints) -> Option<&'a FlightOffer> {
    offers
        .iter()
        .filter(|offer| constraints.accepts(offer.price, offer.stops))
        .fold(None, |best: Option<&FlightOffer>, offer| match best {
            Some(b) if b.price <= offer.price => Some(b),
            _ => Some(offer),
        })
}
