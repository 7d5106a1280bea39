//! Job lifecycle events for observability
//!
//! Runners report milestones as [`RunnerEvent`]s through an [`EventLogger`],
//! which writes them to the tracing pipeline and can keep a copy for tests.

use chrono::Utc;
use farescan_store::JobId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Milestones of a job run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerEvent {
    /// Runner took over the job
    JobStarted {
        job_id: JobId,
        total_combinations: u64,
        resume_from: u64,
        timestamp: i64,
    },
    /// A checkpoint write succeeded
    CheckpointSaved {
        job_id: JobId,
        processed_index: u64,
        version: u64,
        timestamp: i64,
    },
    /// A checkpoint write failed
    CheckpointFailed {
        job_id: JobId,
        processed_index: u64,
        attempt: u32,
        error: String,
        timestamp: i64,
    },
    /// A unit produced no result and was skipped
    UnitFailed {
        job_id: JobId,
        index: u64,
        error: String,
        timestamp: i64,
    },
    JobCompleted {
        job_id: JobId,
        processed: u64,
        found_flights: u64,
        failed_combinations: u64,
        duration_ms: u64,
        timestamp: i64,
    },
    JobFailed {
        job_id: JobId,
        reason: String,
        timestamp: i64,
    },
    JobCancelled {
        job_id: JobId,
        processed: u64,
        timestamp: i64,
    },
    /// Runner gave the job back without finishing it
    JobSuspended {
        job_id: JobId,
        reason: String,
        timestamp: i64,
    },
}

impl RunnerEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            RunnerEvent::JobStarted { job_id, .. }
            | RunnerEvent::CheckpointSaved { job_id, .. }
            | RunnerEvent::CheckpointFailed { job_id, .. }
            | RunnerEvent::UnitFailed { job_id, .. }
            | RunnerEvent::JobCompleted { job_id, .. }
            | RunnerEvent::JobFailed { job_id, .. }
            | RunnerEvent::JobCancelled { job_id, .. }
            | RunnerEvent::JobSuspended { job_id, .. } => *job_id,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            RunnerEvent::JobStarted { timestamp, .. }
            | RunnerEvent::CheckpointSaved { timestamp, .. }
            | RunnerEvent::CheckpointFailed { timestamp, .. }
            | RunnerEvent::UnitFailed { timestamp, .. }
            | RunnerEvent::JobCompleted { timestamp, .. }
            | RunnerEvent::JobFailed { timestamp, .. }
            | RunnerEvent::JobCancelled { timestamp, .. }
            | RunnerEvent::JobSuspended { timestamp, .. } => *timestamp,
        }
    }

    /// Human-readable summary
    pub fn description(&self) -> String {
        match self {
            RunnerEvent::JobStarted {
                total_combinations,
                resume_from,
                ..
            } => format!("Job started at {}/{}", resume_from, total_combinations),
            RunnerEvent::CheckpointSaved {
                processed_index,
                version,
                ..
            } => format!("Checkpoint saved at {} (v{})", processed_index, version),
            RunnerEvent::CheckpointFailed {
                processed_index,
                attempt,
                error,
                ..
            } => format!(
                "Checkpoint at {} failed (attempt {}): {}",
                processed_index, attempt, error
            ),
            RunnerEvent::UnitFailed { index, error, .. } => {
                format!("Combination {} skipped: {}", index, error)
            }
            RunnerEvent::JobCompleted {
                processed,
                found_flights,
                failed_combinations,
                duration_ms,
                ..
            } => format!(
                "Job completed: {} processed, {} flights, {} failed in {}ms",
                processed, found_flights, failed_combinations, duration_ms
            ),
            RunnerEvent::JobFailed { reason, .. } => format!("Job failed: {}", reason),
            RunnerEvent::JobCancelled { processed, .. } => {
                format!("Job cancelled after {} combinations", processed)
            }
            RunnerEvent::JobSuspended { reason, .. } => format!("Job suspended: {}", reason),
        }
    }

    pub fn job_started(job_id: JobId, total_combinations: u64, resume_from: u64) -> Self {
        RunnerEvent::JobStarted {
            job_id,
            total_combinations,
            resume_from,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn checkpoint_saved(job_id: JobId, processed_index: u64, version: u64) -> Self {
        RunnerEvent::CheckpointSaved {
            job_id,
            processed_index,
            version,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn checkpoint_failed(
        job_id: JobId,
        processed_index: u64,
        attempt: u32,
        error: impl Into<String>,
    ) -> Self {
        RunnerEvent::CheckpointFailed {
            job_id,
            processed_index,
            attempt,
            error: error.into(),
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn unit_failed(job_id: JobId, index: u64, error: impl Into<String>) -> Self {
        RunnerEvent::UnitFailed {
            job_id,
            index,
            error: error.into(),
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn job_completed(
        job_id: JobId,
        processed: u64,
        found_flights: u64,
        failed_combinations: u64,
        duration_ms: u64,
    ) -> Self {
        RunnerEvent::JobCompleted {
            job_id,
            processed,
            found_flights,
            failed_combinations,
            duration_ms,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn job_failed(job_id: JobId, reason: impl Into<String>) -> Self {
        RunnerEvent::JobFailed {
            job_id,
            reason: reason.into(),
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn job_cancelled(job_id: JobId, processed: u64) -> Self {
        RunnerEvent::JobCancelled {
            job_id,
            processed,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn job_suspended(job_id: JobId, reason: impl Into<String>) -> Self {
        RunnerEvent::JobSuspended {
            job_id,
            reason: reason.into(),
            timestamp: Utc::now().timestamp(),
        }
    }
}

/// Event sink for runners
#[derive(Debug, Clone)]
pub struct EventLogger {
    enabled: bool,
    recorded: Option<Arc<Mutex<Vec<RunnerEvent>>>>,
}

impl EventLogger {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            recorded: None,
        }
    }

    /// A logger that also keeps every event for inspection
    pub fn recording() -> Self {
        Self {
            enabled: true,
            recorded: Some(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    pub fn log(&self, event: RunnerEvent) {
        if !self.enabled {
            return;
        }

        tracing::info!(
            job_id = %event.job_id(),
            timestamp = event.timestamp(),
            description = %event.description(),
            "Runner event"
        );

        if let Some(recorded) = &self.recorded {
            recorded.lock().push(event);
        }
    }

    /// Events kept so far; empty unless built with [`EventLogger::recording`]
    pub fn events(&self) -> Vec<RunnerEvent> {
        self.recorded
            .as_ref()
            .map(|recorded| recorded.lock().clone())
            .unwrap_or_default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Default for EventLogger {
    fn default() -> Self {
        Self::new(true)
    }
}
