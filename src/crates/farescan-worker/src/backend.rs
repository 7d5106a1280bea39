//! Flight search backend abstraction
//!
//! The worker never talks to a fare source directly; it calls a
//! [`SearchBackend`] with one [`SearchRequest`] per combination. Real scrapers
//! live outside this crate. [`SimulatedBackend`] stands in for one when
//! running the worker locally.

use crate::retry::{Classify, ErrorClass};
use async_trait::async_trait;
use chrono::NaiveDate;
use farescan_store::{Combination, PriceIndicator, SearchConstraints};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// One backend query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub departure: String,
    pub destination: String,
    pub outbound_date: NaiveDate,
    pub return_date: Option<NaiveDate>,
    pub constraints: SearchConstraints,
}

impl SearchRequest {
    pub fn for_combination(combination: &Combination, constraints: SearchConstraints) -> Self {
        Self {
            departure: combination.departure.clone(),
            destination: combination.destination.clone(),
            outbound_date: combination.outbound_date,
            return_date: combination.return_date,
            constraints,
        }
    }

    /// `DEP-DST-outbound[-return]`, stable across runs
    pub fn key(&self) -> String {
        match self.return_date {
            Some(r) => format!(
                "{}-{}-{}-{}",
                self.departure, self.destination, self.outbound_date, r
            ),
            None => format!("{}-{}-{}", self.departure, self.destination, self.outbound_date),
        }
    }
}

/// An offer returned by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightOffer {
    pub price: f64,
    pub airline: String,
    pub stops: u32,
    pub duration: String,
    pub price_indicator: PriceIndicator,
}

/// Backend failure, classified for retry
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// Network, timeout or rate limiting; worth retrying
    #[error("transient backend error: {0}")]
    Transient(String),

    /// Invalid request or unsupported route; retrying will not help
    #[error("permanent backend error: {0}")]
    Permanent(String),
}

impl Classify for BackendError {
    fn class(&self) -> ErrorClass {
        match self {
            BackendError::Transient(_) => ErrorClass::Transient,
            BackendError::Permanent(_) => ErrorClass::Permanent,
        }
    }
}

/// Source of flight offers
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<FlightOffer>, BackendError>;
}

const AIRLINES: [&str; 6] = ["LOT", "Finnair", "Qatar Airways", "Turkish Airlines", "Emirates", "airBaltic"];

/// Deterministic stand-in for a real fare source
///
/// Offers are derived from a seed hashed out of the request key, so the same
/// combination always yields the same offers. A configurable share of calls
/// fails transiently to exercise the retry path.
#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    latency: Duration,
    transient_failure_rate: f64,
}

impl SimulatedBackend {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            transient_failure_rate: 0.0,
        }
    }

    pub fn with_transient_failure_rate(mut self, rate: f64) -> Self {
        self.transient_failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    fn seed(key: &str) -> u64 {
        // FNV-1a
        key.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
            (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
        })
    }

    /// The offers this backend returns for `request`
    pub fn offers_for(request: &SearchRequest) -> Vec<FlightOffer> {
        let mut rng = StdRng::seed_from_u64(Self::seed(&request.key()));
        let count = rng.gen_range(0..=4);
        (0..count)
            .map(|_| {
                let price = f64::from(rng.gen_range(280..=1400u32));
                let stops = rng.gen_range(0..=3);
                let hours = rng.gen_range(9..=30);
                let minutes = rng.gen_range(0..60);
                let price_indicator = match price {
                    p if p < 500.0 => PriceIndicator::Low,
                    p if p < 900.0 => PriceIndicator::Typical,
                    _ => PriceIndicator::High,
                };
                FlightOffer {
                    price,
                    airline: AIRLINES[rng.gen_range(0..AIRLINES.len())].to_string(),
                    stops,
                    duration: format!("{}h {:02}m", hours, minutes),
                    price_indicator,
                }
            })
            .collect()
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

#[async_trait]
impl SearchBackend for SimulatedBackend {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<FlightOffer>, BackendError> {
        tokio::time::sleep(self.latency).await;
        if self.transient_failure_rate > 0.0 && rand::random::<f64>() < self.transient_failure_rate {
            return Err(BackendError::Transient(format!(
                "simulated timeout for {}",
                request.key()
            )));
        }
        Ok(Self::offers_for(request))
    }
}
