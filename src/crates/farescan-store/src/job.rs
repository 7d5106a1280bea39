//! Job identity, status state machine and the job record itself

use crate::params::SearchParameters;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque, immutable job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Job lifecycle status
///
/// `Running` is entered only from `Pending`, and the three terminal
/// states never transition further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Queued, not yet claimed by a worker
    Pending,
    /// Claimed and executing (or orphaned, awaiting recovery)
    Running,
    /// Every combination processed
    Completed,
    /// Stopped by an unrecoverable error
    Failed,
    /// Stopped on request
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// Re-applying the current status is not a transition and is handled by
    /// callers as a no-op.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// A search job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub parameters: SearchParameters,
    pub status: JobStatus,
    /// Derived from `parameters` at creation, fixed afterwards
    pub total_combinations: u64,
    /// Mirrors the persisted checkpoint's `processed_index`
    pub processed_combinations: u64,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a pending job for the given parameters
    pub fn new(parameters: SearchParameters) -> Self {
        let now = Utc::now();
        let total_combinations = parameters.total_combinations();
        Self {
            job_id: JobId::new(),
            parameters,
            status: JobStatus::Pending,
            total_combinations,
            processed_combinations: 0,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fraction of combinations processed, clamped to [0, 1].
    pub fn progress(&self) -> f64 {
        if self.total_combinations == 0 {
            return if self.status == JobStatus::Completed {
                1.0
            } else {
                0.0
            };
        }
        (self.processed_combinations as f64 / self.total_combinations as f64).clamp(0.0, 1.0)
    }
}
