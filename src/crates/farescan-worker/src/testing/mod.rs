//! Test infrastructure for the worker
//!
//! - [`ScriptedBackend`] - a search backend whose answers come from a closure
//! - [`FlakyStore`] - a job store wrapper with injectable write and read faults
//! - [`fixtures`] - sample parameters and offers

use crate::backend::{BackendError, FlightOffer, SearchBackend, SearchRequest};
use crate::limiter::Gauge;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use farescan_store::{
    Checkpoint, FlightResult, Job, JobId, JobRecord, JobStatus, JobStore, Lease, LeaseOutcome,
    SearchParameters, StoreError,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a [`ScriptedBackend`] answers for one call
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Offers(Vec<FlightOffer>),
    /// Answer with offers after an extra delay
    SlowOffers(Duration, Vec<FlightOffer>),
    Transient(String),
    Permanent(String),
    /// Never return
    Hang,
    /// Panic inside the search call
    Panic(String),
}

type Script = dyn Fn(&SearchRequest, u32) -> ScriptedResponse + Send + Sync;

/// Search backend driven by a closure
///
/// The closure receives the request and the attempt number for that request
/// (0 on the first call for a given request key).
pub struct ScriptedBackend {
    script: Box<Script>,
    latency: Duration,
    attempts: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<SearchRequest>>,
    concurrency: Arc<Gauge>,
}

impl ScriptedBackend {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&SearchRequest, u32) -> ScriptedResponse + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            latency: Duration::ZERO,
            attempts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            concurrency: Arc::new(Gauge::default()),
        }
    }

    /// Every call answers with `offers`
    pub fn always(offers: Vec<FlightOffer>) -> Self {
        Self::new(move |_, _| ScriptedResponse::Offers(offers.clone()))
    }

    /// Sleep this long before answering
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Requests received so far, in call order
    pub fn calls(&self) -> Vec<SearchRequest> {
        self.calls.lock().clone()
    }

    /// Most calls that were ever in progress at once
    pub fn peak_concurrency(&self) -> usize {
        self.concurrency.peak()
    }
}

struct InProgress(Arc<Gauge>);

impl InProgress {
    fn enter(gauge: &Arc<Gauge>) -> Self {
        gauge.enter();
        Self(gauge.clone())
    }
}

impl Drop for InProgress {
    fn drop(&mut self) {
        self.0.exit();
    }
}

#[async_trait]
impl SearchBackend for ScriptedBackend {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<FlightOffer>, BackendError> {
        let _in_progress = InProgress::enter(&self.concurrency);
        let attempt = {
            let mut attempts = self.attempts.lock();
            let counter = attempts.entry(request.key()).or_insert(0);
            let attempt = *counter;
            *counter += 1;
            attempt
        };
        self.calls.lock().push(request.clone());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match (self.script)(request, attempt) {
            ScriptedResponse::Offers(offers) => Ok(offers),
            ScriptedResponse::SlowOffers(delay, offers) => {
                tokio::time::sleep(delay).await;
                Ok(offers)
            }
            ScriptedResponse::Transient(message) => Err(BackendError::Transient(message)),
            ScriptedResponse::Permanent(message) => Err(BackendError::Permanent(message)),
            ScriptedResponse::Hang => std::future::pending().await,
            ScriptedResponse::Panic(message) => panic!("{}", message),
        }
    }
}

/// Job store wrapper that fails on demand
///
/// Injected failures surface as [`StoreError::Unavailable`], the way a lost
/// database connection would.
pub struct FlakyStore {
    inner: Arc<dyn JobStore>,
    saves_before_failure: AtomicU64,
    failing_saves: AtomicBool,
    unavailable: AtomicBool,
    save_calls: AtomicU64,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn JobStore>) -> Self {
        Self {
            inner,
            saves_before_failure: AtomicU64::new(u64::MAX),
            failing_saves: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
            save_calls: AtomicU64::new(0),
        }
    }

    /// Let `n` more checkpoint saves through, then fail every later one
    pub fn fail_saves_after(&self, n: u64) {
        self.saves_before_failure.store(n, Ordering::SeqCst);
    }

    /// Fail checkpoint saves from now on, or stop failing them
    pub fn set_failing_saves(&self, failing: bool) {
        self.failing_saves.store(failing, Ordering::SeqCst);
        if !failing {
            self.saves_before_failure.store(u64::MAX, Ordering::SeqCst);
        }
    }

    /// Fail every operation
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Checkpoint save attempts seen, failed ones included
    pub fn save_calls(&self) -> u64 {
        self.save_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> farescan_store::Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected outage".into()))
        } else {
            Ok(())
        }
    }

    fn check_save(&self) -> farescan_store::Result<()> {
        self.check()?;
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected checkpoint failure".into()));
        }
        let allowed = self
            .saves_before_failure
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if allowed.is_err() {
            self.failing_saves.store(true, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected checkpoint failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn create_job(&self, parameters: SearchParameters) -> farescan_store::Result<Job> {
        self.check()?;
        self.inner.create_job(parameters).await
    }

    async fn load(&self, job_id: JobId) -> farescan_store::Result<JobRecord> {
        self.check()?;
        self.inner.load(job_id).await
    }

    async fn save_checkpoint(
        &self,
        job_id: JobId,
        checkpoint: &Checkpoint,
        expected_version: u64,
    ) -> farescan_store::Result<u64> {
        self.check_save()?;
        self.inner.save_checkpoint(job_id, checkpoint, expected_version).await
    }

    async fn set_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        reason: Option<String>,
    ) -> farescan_store::Result<()> {
        self.check()?;
        self.inner.set_status(job_id, status, reason).await
    }

    async fn append_result(&self, result: FlightResult) -> farescan_store::Result<bool> {
        self.check()?;
        self.inner.append_result(result).await
    }

    async fn results(&self, job_id: JobId) -> farescan_store::Result<Vec<FlightResult>> {
        self.check()?;
        self.inner.results(job_id).await
    }

    async fn acquire_lease(
        &self,
        job_id: JobId,
        owner: &str,
        ttl: Duration,
    ) -> farescan_store::Result<LeaseOutcome> {
        self.check()?;
        self.inner.acquire_lease(job_id, owner, ttl).await
    }

    async fn renew_lease(&self, job_id: JobId, owner: &str, ttl: Duration) -> farescan_store::Result<Lease> {
        self.check()?;
        self.inner.renew_lease(job_id, owner, ttl).await
    }

    async fn release_lease(&self, job_id: JobId, owner: &str) -> farescan_store::Result<()> {
        self.check()?;
        self.inner.release_lease(job_id, owner).await
    }

    async fn pending_jobs(&self) -> farescan_store::Result<Vec<JobId>> {
        self.check()?;
        self.inner.pending_jobs().await
    }

    async fn orphaned_jobs(&self, now: DateTime<Utc>) -> farescan_store::Result<Vec<JobId>> {
        self.check()?;
        self.inner.orphaned_jobs(now).await
    }
}

/// Sample data for tests
pub mod fixtures {
    use crate::backend::FlightOffer;
    use chrono::{Duration, NaiveDate};
    use farescan_store::{DatePair, PriceIndicator, SearchParameters};

    /// One route over `days` consecutive one-way dates: `days` combinations
    pub fn one_way_params(days: u32) -> SearchParameters {
        let start = NaiveDate::from_ymd_opt(2025, 11, 1).unwrap_or_default();
        let pairs = (0..days).map(|d| DatePair::one_way(start + Duration::days(i64::from(d))));
        SearchParameters::new(["VNO"], ["BKK"], pairs)
    }

    /// Two departures, two destinations and two round trips: 8 combinations
    pub fn multi_route_params() -> SearchParameters {
        let date = |d| NaiveDate::from_ymd_opt(2025, 11, d).unwrap_or_default();
        SearchParameters::new(
            ["VNO", "RIX"],
            ["BKK", "HKT"],
            [
                DatePair::round_trip(date(1), date(15)),
                DatePair::round_trip(date(2), date(16)),
            ],
        )
    }

    pub fn offer(price: f64) -> FlightOffer {
        FlightOffer {
            price,
            airline: "LOT".into(),
            stops: 1,
            duration: "14h 20m".into(),
            price_indicator: PriceIndicator::Typical,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farescan_store::InMemoryJobStore;

    #[tokio::test]
    async fn test_scripted_backend_counts_attempts_per_key() {
        let backend = ScriptedBackend::new(|_, attempt| {
            if attempt == 0 {
                ScriptedResponse::Transient("first".into())
            } else {
                ScriptedResponse::Offers(vec![fixtures::offer(300.0)])
            }
        });
        let params = fixtures::one_way_params(2);
        let requests: Vec<SearchRequest> = params
            .combinations()
            .map(|c| SearchRequest::for_combination(&c, params.constraints))
            .collect();

        assert!(backend.search(&requests[0]).await.is_err());
        assert!(backend.search(&requests[1]).await.is_err());
        assert!(backend.search(&requests[0]).await.is_ok());
        assert_eq!(backend.call_count(), 3);
    }

    #[tokio::test]
    async fn test_flaky_store_fails_after_budget() {
        let store = FlakyStore::new(Arc::new(InMemoryJobStore::new()));
        let job = store.create_job(fixtures::one_way_params(3)).await.unwrap();
        store.fail_saves_after(1);

        let mut cp = Checkpoint::initial();
        cp.processed_index = 1;
        let version = store.save_checkpoint(job.job_id, &cp, 0).await.unwrap();
        cp.processed_index = 2;
        assert!(store.save_checkpoint(job.job_id, &cp, version).await.is_err());
        assert!(store.save_checkpoint(job.job_id, &cp, version).await.is_err());
        assert_eq!(store.save_calls(), 3);

        store.set_failing_saves(false);
        assert!(store.save_checkpoint(job.job_id, &cp, version).await.is_ok());

        store.set_unavailable(true);
        assert!(matches!(
            store.load(job.job_id).await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
