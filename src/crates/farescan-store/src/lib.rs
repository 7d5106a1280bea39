//! # farescan-store - durable state for long-running fare searches
//!
//! A fare search job expands a set of airports and dates into thousands of
//! search *combinations* and may run for days. This crate owns everything
//! about such a job that must survive a crash:
//!
//! - [`Job`] - identity, immutable [`SearchParameters`], status state machine
//! - [`Checkpoint`] - how far the job got, versioned for optimistic
//!   concurrency
//! - [`FlightResult`] - one accepted offer per combination, append-only
//! - [`Lease`] - which worker may currently execute the job
//!
//! ## Storage backends
//!
//! All access goes through the [`JobStore`] trait:
//!
//! - [`InMemoryJobStore`] - tests and single-process runs
//! - [`FileJobStore`] - one directory per job, atomic file replacement,
//!   checkpoint encoding chosen by a [`SerializerProtocol`]
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use farescan_store::{InMemoryJobStore, JobStore, SearchParameters, DateWindow};
//! use chrono::NaiveDate;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = InMemoryJobStore::new();
//!
//!     let window = DateWindow {
//!         start_date: NaiveDate::from_ymd_opt(2025, 11, 1).unwrap(),
//!         end_date: NaiveDate::from_ymd_opt(2025, 11, 30).unwrap(),
//!         min_duration_days: 14,
//!         max_duration_days: 21,
//!     };
//!     let params = SearchParameters::from_window(["VNO", "RIX"], ["BKK", "HKT"], &window);
//!
//!     let job = store.create_job(params).await?;
//!     println!("{} combinations", job.total_combinations);
//!
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod error;
pub mod file;
pub mod job;
pub mod lease;
pub mod memory;
pub mod params;
pub mod record;
pub mod result;
pub mod serializer;
pub mod status;
pub mod traits;

pub use checkpoint::Checkpoint;
pub use error::{Result, StoreError};
pub use file::FileJobStore;
pub use job::{Job, JobId, JobStatus};
pub use lease::{Lease, LeaseOutcome};
pub use memory::InMemoryJobStore;
pub use params::{
    Combination, DatePair, DateWindow, SearchConstraints, SearchParameters,
    DEFAULT_MAX_CONCURRENT_SEARCHES,
};
pub use record::JobRecord;
pub use result::{FlightResult, PriceIndicator};
pub use serializer::{BincodeSerializer, JsonSerializer, SerializerProtocol};
pub use status::JobStatusReport;
pub use traits::JobStore;
