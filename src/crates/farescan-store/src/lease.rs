//! Time-bounded exclusive execution rights

use crate::job::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A worker's claim on a job until `expires_at`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub job_id: JobId,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    pub fn is_held_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.owner == owner && self.is_live(now)
    }
}

/// Result of a lease acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Acquired(Lease),
    /// A different owner holds a live lease
    Denied {
        holder: String,
        expires_at: DateTime<Utc>,
    },
}

impl LeaseOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LeaseOutcome::Acquired(_))
    }
}
