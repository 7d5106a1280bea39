//! Error types for job store operations

use crate::job::{JobId, JobStatus};
use thiserror::Error;

/// Result type for job store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during job store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// Job not found
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// Optimistic concurrency check failed on a checkpoint write
    #[error("Checkpoint version conflict for job {job_id}: expected {expected}, stored {actual}")]
    VersionConflict {
        job_id: JobId,
        expected: u64,
        actual: u64,
    },

    /// Status change not allowed by the job state machine
    #[error("Invalid status transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// Lease renewal or release by a worker that does not hold it
    #[error("Lease for job {job_id} is not held by {owner}")]
    LeaseNotHeld { job_id: JobId, owner: String },

    /// Checkpoint write for a job that already reached a terminal status
    #[error("Job {job_id} is already {status}")]
    JobFinished { job_id: JobId, status: JobStatus },

    /// Rejected input (bad parameters, checkpoint regression)
    #[error("Invalid: {0}")]
    Invalid(String),

    /// Backend could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary serialization error
    #[error("Binary serialization error: {0}")]
    BinarySerialization(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Io(_))
    }
}
