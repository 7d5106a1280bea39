//! Client-facing job status snapshot

use crate::job::{JobId, JobStatus};
use crate::record::JobRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a job as of its last persisted checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: f64,
    pub processed_combinations: u64,
    pub total_combinations: u64,
    pub found_flights: u64,
    pub failed_combinations: u64,
    pub best_price: Option<f64>,
    pub failure_reason: Option<String>,
    pub last_checkpoint_at: DateTime<Utc>,
    /// Served from cache because the store could not be read
    #[serde(default)]
    pub stale: bool,
}

impl From<&JobRecord> for JobStatusReport {
    fn from(record: &JobRecord) -> Self {
        let job = &record.job;
        let cp = &record.checkpoint;
        Self {
            job_id: job.job_id,
            status: job.status,
            progress: job.progress(),
            processed_combinations: cp.processed_index,
            total_combinations: job.total_combinations,
            found_flights: cp.found_flights,
            failed_combinations: cp.failed_combinations,
            best_price: cp.best_price,
            failure_reason: job.failure_reason.clone(),
            last_checkpoint_at: cp.last_checkpoint_at,
            stale: false,
        }
    }
}
