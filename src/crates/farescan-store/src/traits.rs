//! Storage abstraction for jobs, checkpoints, results and leases
//!
//! [`JobStore`] is the only way the worker touches durable state. Backends
//! must make each method atomic with respect to the others for the same job:
//! a checkpoint save either lands completely with a bumped version or not at
//! all.
//!
//! Two backends ship with this crate:
//!
//! - [`InMemoryJobStore`](crate::memory::InMemoryJobStore) for tests and
//!   single-process runs
//! - [`FileJobStore`](crate::file::FileJobStore), one directory per job, for
//!   local durable runs
//!
//! # Implementing a backend
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use farescan_store::*;
//!
//! pub struct PostgresJobStore { pool: PgPool }
//!
//! #[async_trait]
//! impl JobStore for PostgresJobStore {
//!     async fn save_checkpoint(
//!         &self,
//!         job_id: JobId,
//!         checkpoint: &Checkpoint,
//!         expected_version: u64,
//!     ) -> farescan_store::Result<u64> {
//!         // UPDATE checkpoints SET ..., version = version + 1
//!         //  WHERE job_id = $1 AND version = $2
//!         // zero rows -> StoreError::VersionConflict
//!     }
//!
//!     // ... implement other methods ...
//! }
//! ```

use crate::checkpoint::Checkpoint;
use crate::error::Result;
use crate::job::{Job, JobId, JobStatus};
use crate::lease::{Lease, LeaseOutcome};
use crate::params::SearchParameters;
use crate::record::JobRecord;
use crate::result::FlightResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Durable job state
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Validate `parameters` and persist a new pending job with an initial
    /// checkpoint.
    async fn create_job(&self, parameters: SearchParameters) -> Result<Job>;

    /// Read job, checkpoint and lease
    async fn load(&self, job_id: JobId) -> Result<JobRecord>;

    /// Persist `checkpoint` if the stored version equals `expected_version`.
    ///
    /// Returns the new version, or `StoreError::VersionConflict`.
    async fn save_checkpoint(
        &self,
        job_id: JobId,
        checkpoint: &Checkpoint,
        expected_version: u64,
    ) -> Result<u64>;

    /// Apply a status transition. Setting the current status is a no-op.
    async fn set_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        reason: Option<String>,
    ) -> Result<()>;

    /// Store a result unless one exists for its combination index.
    ///
    /// Returns whether the result was inserted.
    async fn append_result(&self, result: FlightResult) -> Result<bool>;

    /// All results of a job in combination order
    async fn results(&self, job_id: JobId) -> Result<Vec<FlightResult>>;

    /// Claim the job for `owner` for `ttl`
    async fn acquire_lease(&self, job_id: JobId, owner: &str, ttl: Duration) -> Result<LeaseOutcome>;

    /// Extend `owner`'s lease by `ttl` from now
    async fn renew_lease(&self, job_id: JobId, owner: &str, ttl: Duration) -> Result<Lease>;

    async fn release_lease(&self, job_id: JobId, owner: &str) -> Result<()>;

    /// Pending jobs, oldest first
    async fn pending_jobs(&self) -> Result<Vec<JobId>>;

    /// Running jobs without a live lease at `now`
    async fn orphaned_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobId>>;
}
