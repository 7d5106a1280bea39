//! Search parameters and the combination sequence they define
//!
//! A job's parameters are immutable. They expand into a totally ordered,
//! lazily enumerated sequence of [`Combination`]s:
//!
//! ```text
//! for departure in departures        (sorted, de-duplicated)
//!   for destination in destinations  (sorted, de-duplicated, != departure)
//!     for date_pair in date_pairs    (sorted by outbound, then return)
//! ```
//!
//! The index of a combination in this sequence is what checkpoints record,
//! so the order must never depend on anything but the parameters.

use crate::error::{Result, StoreError};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default per-job parallelism
pub const DEFAULT_MAX_CONCURRENT_SEARCHES: usize = 3;

/// Filters applied to offers before they count as found
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchConstraints {
    pub max_price: f64,
    pub max_stops: u32,
}

impl Default for SearchConstraints {
    fn default() -> Self {
        Self {
            max_price: 700.0,
            max_stops: 2,
        }
    }
}

impl SearchConstraints {
    pub fn accepts(&self, price: f64, stops: u32) -> bool {
        price <= self.max_price && stops <= self.max_stops
    }
}

/// One outbound date with an optional return date
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatePair {
    pub outbound: NaiveDate,
    pub return_date: Option<NaiveDate>,
}

impl DatePair {
    pub fn one_way(outbound: NaiveDate) -> Self {
        Self {
            outbound,
            return_date: None,
        }
    }

    pub fn round_trip(outbound: NaiveDate, return_date: NaiveDate) -> Self {
        Self {
            outbound,
            return_date: Some(return_date),
        }
    }
}

/// Travel window that expands into round-trip date pairs
///
/// Every outbound day `d` with `d + min_duration_days <= end_date` yields the
/// pair `(d, d + min_duration_days)`, provided that return date does not pass
/// `min(d + max_duration_days, end_date)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub min_duration_days: u32,
    pub max_duration_days: u32,
}

impl DateWindow {
    pub fn expand(&self) -> Vec<DatePair> {
        let min = Duration::days(i64::from(self.min_duration_days));
        let max = Duration::days(i64::from(self.max_duration_days));

        let mut pairs = Vec::new();
        let mut current = self.start_date;
        while current + min <= self.end_date {
            let min_return = current + min;
            let max_return = std::cmp::min(current + max, self.end_date);
            if min_return <= max_return {
                pairs.push(DatePair::round_trip(current, min_return));
            }
            current += Duration::days(1);
        }
        pairs
    }
}

/// One concrete unit of search work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Combination {
    /// Position in the job's combination sequence
    pub index: u64,
    pub departure: String,
    pub destination: String,
    pub outbound_date: NaiveDate,
    pub return_date: Option<NaiveDate>,
}

impl Combination {
    /// `DEP-DST` key used for per-route statistics
    pub fn route_key(&self) -> String {
        format!("{}-{}", self.departure, self.destination)
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} -> {} on {}",
            self.index, self.departure, self.destination, self.outbound_date
        )?;
        if let Some(return_date) = self.return_date {
            write!(f, " returning {}", return_date)?;
        }
        Ok(())
    }
}

/// Immutable search space descriptor of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchParameters {
    departure_airports: Vec<String>,
    destination_airports: Vec<String>,
    date_pairs: Vec<DatePair>,
    pub constraints: SearchConstraints,
    max_concurrent_searches: usize,
}

impl SearchParameters {
    /// Build parameters, normalizing every axis.
    ///
    /// Airport codes are trimmed, upper-cased, sorted and de-duplicated; date
    /// pairs are sorted and de-duplicated.
    pub fn new<D, A, B>(departures: D, destinations: A, date_pairs: B) -> Self
    where
        D: IntoIterator,
        D::Item: AsRef<str>,
        A: IntoIterator,
        A::Item: AsRef<str>,
        B: IntoIterator<Item = DatePair>,
    {
        let mut date_pairs: Vec<DatePair> = date_pairs.into_iter().collect();
        date_pairs.sort();
        date_pairs.dedup();

        Self {
            departure_airports: normalize_airports(departures),
            destination_airports: normalize_airports(destinations),
            date_pairs,
            constraints: SearchConstraints::default(),
            max_concurrent_searches: DEFAULT_MAX_CONCURRENT_SEARCHES,
        }
    }

    /// Build parameters whose date pairs come from a travel window
    pub fn from_window<D, A>(departures: D, destinations: A, window: &DateWindow) -> Self
    where
        D: IntoIterator,
        D::Item: AsRef<str>,
        A: IntoIterator,
        A::Item: AsRef<str>,
    {
        Self::new(departures, destinations, window.expand())
    }

    pub fn with_constraints(mut self, constraints: SearchConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Per-job parallelism; values below 1 are raised to 1
    pub fn with_max_concurrent_searches(mut self, max: usize) -> Self {
        self.max_concurrent_searches = max.max(1);
        self
    }

    pub fn departure_airports(&self) -> &[String] {
        &self.departure_airports
    }

    pub fn destination_airports(&self) -> &[String] {
        &self.destination_airports
    }

    pub fn date_pairs(&self) -> &[DatePair] {
        &self.date_pairs
    }

    pub fn max_concurrent_searches(&self) -> usize {
        self.max_concurrent_searches
    }

    /// Reject parameters no worker could search with
    pub fn validate(&self) -> Result<()> {
        if let Some(code) = self
            .departure_airports
            .iter()
            .chain(self.destination_airports.iter())
            .find(|code| code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric()))
        {
            return Err(StoreError::Invalid(format!("invalid airport code: {:?}", code)));
        }
        if !(self.constraints.max_price > 0.0) {
            return Err(StoreError::Invalid(format!(
                "max_price must be positive, got {}",
                self.constraints.max_price
            )));
        }
        if let Some(pair) = self
            .date_pairs
            .iter()
            .find(|p| p.return_date.is_some_and(|r| r < p.outbound))
        {
            return Err(StoreError::Invalid(format!(
                "return date before outbound date: {:?}",
                pair
            )));
        }
        Ok(())
    }

    fn routes(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.departure_airports.iter().flat_map(move |dep| {
            self.destination_airports
                .iter()
                .filter(move |dest| *dest != dep)
                .map(move |dest| (dep.as_str(), dest.as_str()))
        })
    }

    pub fn total_combinations(&self) -> u64 {
        self.routes().count() as u64 * self.date_pairs.len() as u64
    }

    /// The combination at `index`, without enumerating its predecessors
    pub fn combination_at(&self, index: u64) -> Option<Combination> {
        let pairs = self.date_pairs.len() as u64;
        if pairs == 0 {
            return None;
        }
        let pair = self.date_pairs[(index % pairs) as usize];
        let (dep, dest) = self.routes().nth((index / pairs) as usize)?;
        Some(Combination {
            index,
            departure: dep.to_string(),
            destination: dest.to_string(),
            outbound_date: pair.outbound,
            return_date: pair.return_date,
        })
    }

    /// The full combination sequence
    pub fn combinations(&self) -> impl Iterator<Item = Combination> + '_ {
        self.combinations_from(0)
    }

    /// The combination sequence starting at `start`
    pub fn combinations_from(&self, start: u64) -> impl Iterator<Item = Combination> + '_ {
        self.routes()
            .flat_map(move |(dep, dest)| {
                self.date_pairs.iter().map(move |pair| (dep, dest, *pair))
            })
            .enumerate()
            .skip(start as usize)
            .map(|(index, (dep, dest, pair))| Combination {
                index: index as u64,
                departure: dep.to_string(),
                destination: dest.to_string(),
                outbound_date: pair.outbound,
                return_date: pair.return_date,
            })
    }
}

fn normalize_airports<I>(codes: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut codes: Vec<String> = codes
        .into_iter()
        .map(|c| c.as_ref().trim().to_ascii_uppercase())
        .collect();
    codes.sort();
    codes.dedup();
    codes
}
