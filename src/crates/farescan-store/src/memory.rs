//! In-memory job store for development and testing
//!
//! [`InMemoryJobStore`] keeps every [`JobRecord`] in an `Arc<RwLock<HashMap>>`.
//! Clones share the same storage, so a test can hand one clone to a worker and
//! inspect state through another. Nothing survives a process restart; use
//! [`FileJobStore`](crate::file::FileJobStore) when it must.

use crate::{
    checkpoint::Checkpoint,
    error::{Result, StoreError},
    job::{Job, JobId, JobStatus},
    lease::{Lease, LeaseOutcome},
    params::SearchParameters,
    record::JobRecord,
    result::FlightResult,
    traits::JobStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct JobEntry {
    record: JobRecord,
    results: BTreeMap<u64, FlightResult>,
}

type JobStorage = Arc<RwLock<HashMap<JobId, JobEntry>>>;

/// In-memory job store
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobStore {
    storage: JobStorage,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs held
    pub async fn job_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Insert a record as-is, bypassing validation.
    ///
    /// Lets tests stage states the public API never produces, such as a
    /// corrupted total.
    pub async fn insert_record(&self, record: JobRecord) {
        self.storage.write().await.insert(
            record.job.job_id,
            JobEntry {
                record,
                results: BTreeMap::new(),
            },
        );
    }

    /// Clear all jobs (useful for testing)
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }

    async fn with_record<T>(
        &self,
        job_id: JobId,
        f: impl FnOnce(&mut JobRecord) -> Result<T>,
    ) -> Result<T> {
        let mut storage = self.storage.write().await;
        let entry = storage.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        f(&mut entry.record)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, parameters: SearchParameters) -> Result<Job> {
        parameters.validate()?;
        let job = Job::new(parameters);
        self.insert_record(JobRecord::new(job.clone())).await;
        Ok(job)
    }

    async fn load(&self, job_id: JobId) -> Result<JobRecord> {
        let storage = self.storage.read().await;
        storage
            .get(&job_id)
            .map(|entry| entry.record.clone())
            .ok_or(StoreError::NotFound(job_id))
    }

    async fn save_checkpoint(
        &self,
        job_id: JobId,
        checkpoint: &Checkpoint,
        expected_version: u64,
    ) -> Result<u64> {
        self.with_record(job_id, |record| {
            record.apply_checkpoint(checkpoint, expected_version)
        })
        .await
    }

    async fn set_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        reason: Option<String>,
    ) -> Result<()> {
        self.with_record(job_id, |record| record.apply_status(status, reason).map(|_| ()))
            .await
    }

    async fn append_result(&self, result: FlightResult) -> Result<bool> {
        let mut storage = self.storage.write().await;
        let entry = storage
            .get_mut(&result.job_id)
            .ok_or(StoreError::NotFound(result.job_id))?;

        if entry.results.contains_key(&result.combination_index) {
            return Ok(false);
        }
        entry.results.insert(result.combination_index, result);
        Ok(true)
    }

    async fn results(&self, job_id: JobId) -> Result<Vec<FlightResult>> {
        let storage = self.storage.read().await;
        let entry = storage.get(&job_id).ok_or(StoreError::NotFound(job_id))?;
        Ok(entry.results.values().cloned().collect())
    }

    async fn acquire_lease(&self, job_id: JobId, owner: &str, ttl: Duration) -> Result<LeaseOutcome> {
        self.with_record(job_id, |record| record.grant_lease(owner, ttl, Utc::now()))
            .await
    }

    async fn renew_lease(&self, job_id: JobId, owner: &str, ttl: Duration) -> Result<Lease> {
        self.with_record(job_id, |record| record.extend_lease(owner, ttl, Utc::now()))
            .await
    }

    async fn release_lease(&self, job_id: JobId, owner: &str) -> Result<()> {
        self.with_record(job_id, |record| record.release_lease(owner))
            .await
    }

    async fn pending_jobs(&self) -> Result<Vec<JobId>> {
        let storage = self.storage.read().await;
        let mut pending: Vec<&Job> = storage
            .values()
            .map(|entry| &entry.record.job)
            .filter(|job| job.status == JobStatus::Pending)
            .collect();
        pending.sort_by_key(|job| (job.created_at, job.job_id));
        Ok(pending.into_iter().map(|job| job.job_id).collect())
    }

    async fn orphaned_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let storage = self.storage.read().await;
        let mut orphaned: Vec<JobId> = storage
            .values()
            .filter(|entry| entry.record.is_orphaned(now))
            .map(|entry| entry.record.job.job_id)
            .collect();
        orphaned.sort();
        Ok(orphaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::DatePair;
    use crate::result::PriceIndicator;
    use chrono::NaiveDate;

    fn params(days: u32) -> SearchParameters {
        SearchParameters::new(
            ["VNO", "RIX"],
            ["BKK"],
            (1..=days).map(|d| DatePair::one_way(NaiveDate::from_ymd_opt(2025, 4, d).unwrap())),
        )
    }

    #[tokio::test]
    async fn test_create_and_load() {
        let store = InMemoryJobStore::new();
        let job = store.create_job(params(3)).await.unwrap();

        let record = store.load(job.job_id).await.unwrap();
        assert_eq!(record.job.status, JobStatus::Pending);
        assert_eq!(record.job.total_combinations, 6);
        assert_eq!(record.checkpoint.version, 0);
        assert!(record.lease.is_none());
        assert_eq!(store.pending_jobs().await.unwrap(), vec![job.job_id]);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let store = InMemoryJobStore::new();
        let err = store.load(JobId::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_append_result_is_idempotent() {
        let store = InMemoryJobStore::new();
        let job = store.create_job(params(1)).await.unwrap();
        let combination = job.parameters.combinations().next().unwrap();

        let result = FlightResult::for_combination(
            job.job_id,
            &combination,
            350.0,
            "LOT",
            1,
            "13h 05m",
            PriceIndicator::Low,
        );
        assert!(store.append_result(result.clone()).await.unwrap());
        assert!(!store.append_result(result).await.unwrap());
        assert_eq!(store.results(job.job_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_orphaned_jobs() {
        let store = InMemoryJobStore::new();
        let job = store.create_job(params(1)).await.unwrap();
        store.set_status(job.job_id, JobStatus::Running, None).await.unwrap();
        assert_eq!(store.orphaned_jobs(Utc::now()).await.unwrap(), vec![job.job_id]);

        store
            .acquire_lease(job.job_id, "worker-1", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.orphaned_jobs(Utc::now()).await.unwrap().is_empty());
        assert!(store.pending_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_parameters() {
        let store = InMemoryJobStore::new();
        let bad = SearchParameters::new(["??"], ["BKK"], []);
        assert!(store.create_job(bad).await.is_err());
        assert_eq!(store.job_count().await, 0);
    }
}
