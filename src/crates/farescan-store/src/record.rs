//! The stored state of one job and the rules for changing it
//!
//! Every [`JobStore`](crate::traits::JobStore) backend keeps a [`JobRecord`]
//! per job and applies changes through the methods here, so the version check,
//! the status state machine and the lease rules are identical across backends.

use crate::checkpoint::Checkpoint;
use crate::error::{Result, StoreError};
use crate::job::{Job, JobStatus};
use crate::lease::{Lease, LeaseOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Job, checkpoint and current lease as read from a store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job: Job,
    pub checkpoint: Checkpoint,
    pub lease: Option<Lease>,
}

impl JobRecord {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            checkpoint: Checkpoint::initial(),
            lease: None,
        }
    }

    /// Replace the stored checkpoint if `expected_version` matches.
    ///
    /// Returns the new version. Progress may not regress or pass the total,
    /// `best_price` may only go down, and a finished job keeps its last
    /// checkpoint.
    pub fn apply_checkpoint(&mut self, checkpoint: &Checkpoint, expected_version: u64) -> Result<u64> {
        let job_id = self.job.job_id;
        let current = &self.checkpoint;

        if self.job.status.is_terminal() {
            return Err(StoreError::JobFinished {
                job_id,
                status: self.job.status,
            });
        }
        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                job_id,
                expected: expected_version,
                actual: current.version,
            });
        }
        if checkpoint.processed_index < current.processed_index {
            return Err(StoreError::Invalid(format!(
                "checkpoint for job {} regresses from {} to {}",
                job_id, current.processed_index, checkpoint.processed_index
            )));
        }
        if !checkpoint.is_within(self.job.total_combinations) {
            return Err(StoreError::Invalid(format!(
                "checkpoint for job {} at {} exceeds total {}",
                job_id, checkpoint.processed_index, self.job.total_combinations
            )));
        }
        if let Some(best) = current.best_price {
            match checkpoint.best_price {
                Some(price) if price <= best => {}
                _ => {
                    return Err(StoreError::Invalid(format!(
                        "best price for job {} may not rise above {}",
                        job_id, best
                    )))
                }
            }
        }

        let now = Utc::now();
        let version = current.version + 1;
        self.checkpoint = Checkpoint {
            version,
            last_checkpoint_at: now,
            ..checkpoint.clone()
        };
        self.job.processed_combinations = checkpoint.processed_index;
        self.job.updated_at = now;
        Ok(version)
    }

    /// Move the job to `status`.
    ///
    /// Returns `false` when the job already has that status.
    pub fn apply_status(&mut self, status: JobStatus, reason: Option<String>) -> Result<bool> {
        if self.job.status == status {
            return Ok(false);
        }
        if !self.job.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                job_id: self.job.job_id,
                from: self.job.status,
                to: status,
            });
        }

        self.job.status = status;
        if status == JobStatus::Failed {
            self.job.failure_reason = reason;
        }
        self.job.updated_at = Utc::now();
        Ok(true)
    }

    /// Grant `owner` a lease unless someone else holds a live one.
    pub fn grant_lease(&mut self, owner: &str, ttl: Duration, now: DateTime<Utc>) -> Result<LeaseOutcome> {
        if let Some(lease) = &self.lease {
            if lease.is_live(now) && lease.owner != owner {
                return Ok(LeaseOutcome::Denied {
                    holder: lease.owner.clone(),
                    expires_at: lease.expires_at,
                });
            }
        }

        let lease = Lease {
            job_id: self.job.job_id,
            owner: owner.to_string(),
            expires_at: now + chrono_ttl(ttl)?,
        };
        self.lease = Some(lease.clone());
        Ok(LeaseOutcome::Acquired(lease))
    }

    /// Push the expiry of `owner`'s lease to `now + ttl`.
    ///
    /// Fails with `LeaseNotHeld` once another owner has taken the job.
    pub fn extend_lease(&mut self, owner: &str, ttl: Duration, now: DateTime<Utc>) -> Result<Lease> {
        let ttl = chrono_ttl(ttl)?;
        match self.lease.as_mut() {
            Some(lease) if lease.owner == owner => {
                lease.expires_at = now + ttl;
                Ok(lease.clone())
            }
            _ => Err(StoreError::LeaseNotHeld {
                job_id: self.job.job_id,
                owner: owner.to_string(),
            }),
        }
    }

    /// Drop `owner`'s lease. Releasing a lease that no longer exists is a no-op.
    pub fn release_lease(&mut self, owner: &str) -> Result<()> {
        match &self.lease {
            None => Ok(()),
            Some(lease) if lease.owner == owner => {
                self.lease = None;
                Ok(())
            }
            Some(_) => Err(StoreError::LeaseNotHeld {
                job_id: self.job.job_id,
                owner: owner.to_string(),
            }),
        }
    }

    /// Running, but nobody holds a live lease
    pub fn is_orphaned(&self, now: DateTime<Utc>) -> bool {
        self.job.status == JobStatus::Running
            && self.lease.as_ref().map_or(true, |lease| !lease.is_live(now))
    }
}

fn chrono_ttl(ttl: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(ttl)
        .map_err(|e| StoreError::Invalid(format!("lease ttl out of range: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{DatePair, SearchParameters};
    use chrono::NaiveDate;

    fn record(total_days: u32) -> JobRecord {
        let pairs = (1..=total_days)
            .map(|d| DatePair::one_way(NaiveDate::from_ymd_opt(2025, 5, d).unwrap()));
        JobRecord::new(Job::new(SearchParameters::new(["VNO"], ["BKK"], pairs)))
    }

    fn at(index: u64) -> Checkpoint {
        Checkpoint {
            processed_index: index,
            ..Checkpoint::initial()
        }
    }

    #[test]
    fn test_checkpoint_bumps_version() {
        let mut rec = record(5);
        assert_eq!(rec.apply_checkpoint(&at(2), 0).unwrap(), 1);
        assert_eq!(rec.apply_checkpoint(&at(4), 1).unwrap(), 2);
        assert_eq!(rec.job.processed_combinations, 4);
        assert_eq!(rec.checkpoint.version, 2);
    }

    #[test]
    fn test_stale_version_conflicts() {
        let mut rec = record(5);
        rec.apply_checkpoint(&at(2), 0).unwrap();
        let err = rec.apply_checkpoint(&at(3), 0).unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { expected: 0, actual: 1, .. }));
        assert_eq!(rec.checkpoint.processed_index, 2);
    }

    #[test]
    fn test_checkpoint_rejects_regression_and_overflow() {
        let mut rec = record(5);
        rec.apply_checkpoint(&at(3), 0).unwrap();
        assert!(matches!(rec.apply_checkpoint(&at(2), 1), Err(StoreError::Invalid(_))));
        assert!(matches!(rec.apply_checkpoint(&at(6), 1), Err(StoreError::Invalid(_))));
    }

    #[test]
    fn test_terminal_job_rejects_checkpoint() {
        let mut rec = record(5);
        rec.apply_checkpoint(&at(1), 0).unwrap();
        for status in [JobStatus::Cancelled, JobStatus::Failed, JobStatus::Completed] {
            rec.job.status = status;
            let err = rec.apply_checkpoint(&at(3), 1).unwrap_err();
            assert!(matches!(err, StoreError::JobFinished { status: s, .. } if s == status));
        }
        assert_eq!(rec.checkpoint.processed_index, 1);
        assert_eq!(rec.checkpoint.version, 1);
    }

    #[test]
    fn test_best_price_cannot_rise() {
        let mut rec = record(5);
        let mut cp = at(1);
        cp.best_price = Some(500.0);
        rec.apply_checkpoint(&cp, 0).unwrap();

        cp.processed_index = 2;
        cp.best_price = Some(510.0);
        assert!(rec.apply_checkpoint(&cp, 1).is_err());
        cp.best_price = None;
        assert!(rec.apply_checkpoint(&cp, 1).is_err());
        cp.best_price = Some(480.0);
        assert!(rec.apply_checkpoint(&cp, 1).is_ok());
    }

    #[test]
    fn test_status_transitions() {
        let mut rec = record(1);
        assert!(rec.apply_status(JobStatus::Running, None).unwrap());
        assert!(!rec.apply_status(JobStatus::Running, None).unwrap());
        assert!(matches!(
            rec.apply_status(JobStatus::Pending, None),
            Err(StoreError::InvalidTransition { .. })
        ));
        rec.apply_status(JobStatus::Failed, Some("boom".into())).unwrap();
        assert_eq!(rec.job.failure_reason.as_deref(), Some("boom"));
        assert!(rec.apply_status(JobStatus::Cancelled, None).is_err());
    }

    #[test]
    fn test_lease_exclusivity() {
        let mut rec = record(1);
        let now = Utc::now();
        let ttl = Duration::from_secs(30);

        assert!(rec.grant_lease("worker-a", ttl, now).unwrap().is_acquired());
        match rec.grant_lease("worker-b", ttl, now).unwrap() {
            LeaseOutcome::Denied { holder, .. } => assert_eq!(holder, "worker-a"),
            other => panic!("expected denial, got {:?}", other),
        }

        let later = now + chrono::Duration::seconds(31);
        assert!(rec.grant_lease("worker-b", ttl, later).unwrap().is_acquired());
        assert!(matches!(
            rec.extend_lease("worker-a", ttl, later),
            Err(StoreError::LeaseNotHeld { .. })
        ));
        assert!(rec.release_lease("worker-a").is_err());
        rec.release_lease("worker-b").unwrap();
        rec.release_lease("worker-b").unwrap();
    }

    #[test]
    fn test_orphan_detection() {
        let mut rec = record(1);
        let now = Utc::now();
        assert!(!rec.is_orphaned(now));

        rec.apply_status(JobStatus::Running, None).unwrap();
        assert!(rec.is_orphaned(now));

        rec.grant_lease("w", Duration::from_secs(10), now).unwrap();
        assert!(!rec.is_orphaned(now));
        assert!(rec.is_orphaned(now + chrono::Duration::seconds(11)));
    }
}
