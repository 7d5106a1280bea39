//! Found flights

use crate::job::JobId;
use crate::params::Combination;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How an offer's price compares to what is usual for the route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceIndicator {
    Low,
    #[default]
    Typical,
    High,
}

impl fmt::Display for PriceIndicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PriceIndicator::Low => "low",
            PriceIndicator::Typical => "typical",
            PriceIndicator::High => "high",
        })
    }
}

impl FromStr for PriceIndicator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(PriceIndicator::Low),
            "typical" => Ok(PriceIndicator::Typical),
            "high" => Ok(PriceIndicator::High),
            other => Err(format!("unknown price indicator: {}", other)),
        }
    }
}

/// The accepted offer of one combination
///
/// At most one result exists per `(job_id, combination_index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightResult {
    pub job_id: JobId,
    pub combination_index: u64,
    pub departure_airport: String,
    pub destination_airport: String,
    pub outbound_date: NaiveDate,
    pub return_date: Option<NaiveDate>,
    pub price: f64,
    pub airline: String,
    pub stops: u32,
    /// Free-form duration as reported by the backend, e.g. `"14h 20m"`
    pub duration: String,
    pub price_indicator: PriceIndicator,
    pub created_at: DateTime<Utc>,
}

impl FlightResult {
    /// Result for `combination` carrying the offer's details
    pub fn for_combination(
        job_id: JobId,
        combination: &Combination,
        price: f64,
        airline: impl Into<String>,
        stops: u32,
        duration: impl Into<String>,
        price_indicator: PriceIndicator,
    ) -> Self {
        Self {
            job_id,
            combination_index: combination.index,
            departure_airport: combination.departure.clone(),
            destination_airport: combination.destination.clone(),
            outbound_date: combination.outbound_date,
            return_date: combination.return_date,
            price,
            airline: airline.into(),
            stops,
            duration: duration.into(),
            price_indicator,
            created_at: Utc::now(),
        }
    }
}
