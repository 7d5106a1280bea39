//! Error types for the worker

use crate::retry::{Classify, ErrorClass};
use farescan_store::{JobId, StoreError};
use thiserror::Error;

/// Result type for worker operations
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Errors surfaced by the worker's components
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Underlying job store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Persisted state contradicts the job's parameters
    #[error("Integrity error for job {job_id}: {reason}")]
    Integrity { job_id: JobId, reason: String },

    /// Checkpoint writes kept failing
    #[error("Store unavailable for job {job_id} after {attempts} attempts: {message}")]
    StoreUnavailable {
        job_id: JobId,
        attempts: u32,
        message: String,
    },

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Notification queue failure
    #[error("Queue error: {0}")]
    Queue(String),

    /// The concurrency limiter was closed
    #[error("Concurrency limiter closed")]
    LimiterClosed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// Whether the dispatcher should back off and retry the delivery
    pub fn is_transient(&self) -> bool {
        match self {
            WorkerError::Store(e) => e.is_transient(),
            WorkerError::StoreUnavailable { .. } | WorkerError::Queue(_) | WorkerError::Io(_) => true,
            _ => false,
        }
    }
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        if self.is_transient() {
            ErrorClass::Transient
        } else {
            ErrorClass::Permanent
        }
    }
}
