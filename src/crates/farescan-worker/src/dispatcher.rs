//! Turns job-ready notifications into running jobs
//!
//! The dispatcher pulls deliveries from a [`NotificationQueue`], claims each
//! job with a lease, and hands it to a [`JobRunner`] under a supervisor task.
//! The supervisor keeps the lease alive, watches for cancellation, and
//! settles the delivery:
//!
//! - acked once the runner has re-saved its checkpoint under the lease, or
//!   the job reached a final state;
//! - nacked when the runner gave the job back before that.
//!
//! A reconciler loop republishes running jobs whose lease has lapsed, which
//! is how work of a crashed worker gets picked up again.

use crate::config::LeaseSettings;
use crate::error::Result;
use crate::queue::{Delivery, DeliveryTag, NotificationQueue};
use crate::registry::{ActiveJobs, StopReason, StopSignal};
use crate::retry::RetryPolicy;
use crate::runner::{JobRunner, RunOutcome, RunReport, RunnerContext, SuspendReason};
use crate::shutdown::ShutdownCoordinator;
use chrono::Utc;
use farescan_store::{JobId, JobStatus, JobStore, LeaseOutcome, StoreError};
use std::fmt::Display;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Why a delivery was settled without running its job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Already running in this process
    AlreadyActive,
    NotFound,
    Terminal(JobStatus),
    /// Another worker holds a live lease
    LeaseHeld { holder: String },
}

/// What became of one delivery
#[derive(Debug)]
pub enum Dispatch {
    /// A runner was started; the handle yields its report
    Started(JoinHandle<Option<RunReport>>),
    Dropped(DropReason),
    /// Nacked after a store error
    Deferred,
}

/// Result of a cancellation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Status set to cancelled; `stopped_runner` if it was executing here
    Cancelled { stopped_runner: bool },
    /// The job had already finished
    AlreadyFinished(JobStatus),
}

/// Cancel `job_id`, stopping its runner when it executes in `registry`.
///
/// Runners elsewhere notice the new status at their next checkpoint or lease
/// renewal.
pub async fn cancel_job(
    store: &dyn JobStore,
    registry: Option<&ActiveJobs>,
    job_id: JobId,
) -> Result<CancelOutcome> {
    let record = store.load(job_id).await?;
    if record.job.status.is_terminal() {
        return Ok(CancelOutcome::AlreadyFinished(record.job.status));
    }

    store.set_status(job_id, JobStatus::Cancelled, None).await?;
    let stopped_runner = registry.map_or(false, |r| r.stop(job_id, StopReason::Cancelled));
    info!(job_id = %job_id, stopped_runner, "Job cancelled");
    Ok(CancelOutcome::Cancelled { stopped_runner })
}

/// Pulls deliveries and supervises runners
#[derive(Clone)]
pub struct Dispatcher {
    ctx: RunnerContext,
    queue: Arc<dyn NotificationQueue>,
    registry: ActiveJobs,
    owner: String,
    lease: LeaseSettings,
    infra_retry: RetryPolicy,
    infra_error_threshold: u32,
    infra_errors: Arc<AtomicU32>,
    shutdown: ShutdownCoordinator,
}

impl Dispatcher {
    pub fn new(
        ctx: RunnerContext,
        queue: Arc<dyn NotificationQueue>,
        owner: impl Into<String>,
        lease: LeaseSettings,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            ctx,
            queue,
            registry: ActiveJobs::new(),
            owner: owner.into(),
            lease,
            infra_retry: RetryPolicy {
                max_retries: u32::MAX,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(30),
                multiplier: 2.0,
                jitter: true,
            },
            infra_error_threshold: 5,
            infra_errors: Arc::new(AtomicU32::new(0)),
            shutdown,
        }
    }

    /// Backoff after store errors, and how many in a row before they are
    /// logged at error level
    pub fn with_infra_backoff(mut self, policy: RetryPolicy, threshold: u32) -> Self {
        self.infra_retry = policy;
        self.infra_error_threshold = threshold.max(1);
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn registry(&self) -> &ActiveJobs {
        &self.registry
    }

    /// Consecutive store errors seen while handling deliveries
    pub fn infra_errors(&self) -> u32 {
        self.infra_errors.load(Ordering::SeqCst)
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<CancelOutcome> {
        cancel_job(self.ctx.store.as_ref(), Some(&self.registry), job_id).await
    }

    /// Take deliveries until shutdown, then suspend every running job and
    /// wait for the runners to return.
    pub async fn run(&self) -> Result<()> {
        info!(owner = %self.owner, "Dispatcher started");
        let mut supervisors: Vec<JoinHandle<Option<RunReport>>> = Vec::new();

        loop {
            let received = tokio::select! {
                _ = self.shutdown.wait_for_shutdown() => break,
                received = self.queue.receive() => received,
            };

            match received {
                Ok(delivery) => match self.handle_delivery(delivery).await {
                    Ok(Dispatch::Started(handle)) => supervisors.push(handle),
                    Ok(Dispatch::Dropped(reason)) => debug!(reason = ?reason, "Delivery dropped"),
                    Ok(Dispatch::Deferred) => self.back_off().await,
                    Err(e) => {
                        self.record_infra_error(&e);
                        self.back_off().await;
                    }
                },
                Err(e) => {
                    self.record_infra_error(&e);
                    self.back_off().await;
                }
            }
            supervisors.retain(|handle| !handle.is_finished());
        }

        info!(
            running = self.registry.len(),
            cause = ?self.shutdown.cause(),
            "Dispatcher stopping, suspending running jobs"
        );
        self.registry.stop_all(StopReason::Shutdown);
        for handle in supervisors {
            if let Err(e) = handle.await {
                error!(error = %e, "Supervisor task failed");
            }
        }
        info!("Dispatcher stopped");
        Ok(())
    }

    /// Decide what to do with one delivery, settling it unless a runner
    /// takes it over.
    pub async fn handle_delivery(&self, delivery: Delivery) -> Result<Dispatch> {
        let job_id = delivery.job_id;
        let span = info_span!("delivery", job_id = %job_id, tag = %delivery.tag);
        self.dispatch(delivery).instrument(span).await.map_err(|e| {
            warn!(job_id = %job_id, error = %e, "Delivery handling failed");
            e
        })
    }

    async fn dispatch(&self, delivery: Delivery) -> Result<Dispatch> {
        let job_id = delivery.job_id;
        let store = &self.ctx.store;

        if self.registry.contains(job_id) {
            self.queue.ack(delivery.tag).await?;
            return Ok(Dispatch::Dropped(DropReason::AlreadyActive));
        }

        let record = match store.load(job_id).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                warn!("Notification for unknown job");
                self.queue.ack(delivery.tag).await?;
                return Ok(Dispatch::Dropped(DropReason::NotFound));
            }
            Err(e) => return self.defer(delivery.tag, &e).await,
        };

        let status = record.job.status;
        if status.is_terminal() {
            debug!(status = %status, "Job already finished");
            self.queue.ack(delivery.tag).await?;
            return Ok(Dispatch::Dropped(DropReason::Terminal(status)));
        }

        match store.acquire_lease(job_id, &self.owner, self.lease.ttl()).await {
            Ok(LeaseOutcome::Acquired(lease)) => {
                debug!(expires_at = %lease.expires_at, "Lease acquired");
            }
            Ok(LeaseOutcome::Denied { holder, expires_at }) => {
                info!(holder = %holder, expires_at = %expires_at, "Job leased by another worker");
                self.queue.ack(delivery.tag).await?;
                return Ok(Dispatch::Dropped(DropReason::LeaseHeld { holder }));
            }
            Err(e) => return self.defer(delivery.tag, &e).await,
        }

        if status == JobStatus::Pending {
            if let Err(e) = store.set_status(job_id, JobStatus::Running, None).await {
                self.release_lease(job_id).await;
                return self.defer(delivery.tag, &e).await;
            }
        }

        let Some(stop) = self.registry.try_register(job_id, &self.owner) else {
            self.queue.ack(delivery.tag).await?;
            return Ok(Dispatch::Dropped(DropReason::AlreadyActive));
        };
        self.infra_errors.store(0, Ordering::SeqCst);

        info!(status = %status, redelivered = delivery.redelivered, "Starting job");
        let supervisor = self.clone().supervise(job_id, delivery.tag, stop);
        Ok(Dispatch::Started(tokio::spawn(supervisor.in_current_span())))
    }

    async fn defer(&self, tag: DeliveryTag, error: &StoreError) -> Result<Dispatch> {
        self.record_infra_error(error);
        self.queue.nack(tag).await?;
        Ok(Dispatch::Deferred)
    }

    async fn supervise(self, job_id: JobId, tag: DeliveryTag, stop: StopSignal) -> Option<RunReport> {
        let (confirmed_tx, mut confirmed_rx) = oneshot::channel();
        let runner = JobRunner::new(job_id, self.ctx.clone(), stop.clone()).on_confirmed(confirmed_tx);
        let mut run = tokio::spawn(runner.run().in_current_span());
        let heartbeat = tokio::spawn(self.clone().heartbeat(job_id, stop.clone()).in_current_span());

        let mut settled = false;
        let mut awaiting_confirmation = true;
        let joined = loop {
            tokio::select! {
                joined = &mut run => break joined,
                confirmed = &mut confirmed_rx, if awaiting_confirmation => {
                    awaiting_confirmation = false;
                    if confirmed.is_ok() {
                        settled = self.settle(tag, true).await;
                    }
                }
            }
        };
        heartbeat.abort();

        let report = match joined {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                warn!(error = %e, "Runner stopped before executing");
                None
            }
            Err(e) => {
                error!(error = %e, "Runner task failed");
                None
            }
        };

        let outcome = report.as_ref().map(|r| &r.outcome);
        if !settled {
            self.settle(tag, outcome.map_or(false, RunOutcome::is_final)).await;
        }

        let lease_gone = matches!(
            outcome,
            Some(RunOutcome::Suspended {
                reason: SuspendReason::LeaseLost | SuspendReason::VersionConflict
            })
        );
        if !lease_gone {
            self.release_lease(job_id).await;
        }
        self.registry.remove(job_id);
        report
    }

    async fn settle(&self, tag: DeliveryTag, ack: bool) -> bool {
        let settled = if ack {
            self.queue.ack(tag).await
        } else {
            self.queue.nack(tag).await
        };
        match settled {
            Ok(()) => true,
            Err(e) => {
                warn!(tag = %tag, ack, error = %e, "Could not settle delivery");
                false
            }
        }
    }

    /// Renew the lease until the runner stops, and watch for cancellation.
    async fn heartbeat(self, job_id: JobId, stop: StopSignal) {
        let every = self.lease.renew_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);

        loop {
            tokio::select! {
                _ = stop.tripped() => return,
                _ = ticker.tick() => {}
            }

            match self
                .ctx
                .store
                .renew_lease(job_id, &self.owner, self.lease.ttl())
                .await
            {
                Ok(lease) => debug!(expires_at = %lease.expires_at, "Lease renewed"),
                Err(StoreError::LeaseNotHeld { .. }) => {
                    warn!("Lease taken by another worker, stopping job");
                    stop.trip(StopReason::LeaseLost);
                    return;
                }
                Err(e) => warn!(error = %e, "Lease renewal failed"),
            }

            match self.ctx.store.load(job_id).await {
                Ok(record) if record.job.status == JobStatus::Cancelled => {
                    info!("Cancellation observed in store");
                    stop.trip(StopReason::Cancelled);
                    return;
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "Status poll failed"),
            }
        }
    }

    async fn release_lease(&self, job_id: JobId) {
        if let Err(e) = self.ctx.store.release_lease(job_id, &self.owner).await {
            warn!(job_id = %job_id, error = %e, "Could not release lease");
        }
    }

    fn record_infra_error(&self, error: &dyn Display) {
        let consecutive = self.infra_errors.fetch_add(1, Ordering::SeqCst) + 1;
        if consecutive >= self.infra_error_threshold {
            error!(consecutive, error = %error, "Job store keeps failing");
        } else {
            warn!(consecutive, error = %error, "Job store error, backing off");
        }
    }

    async fn back_off(&self) {
        let errors = self.infra_errors.load(Ordering::SeqCst);
        let delay = self.infra_retry.backoff_delay(errors.saturating_sub(1));
        tokio::select! {
            _ = self.shutdown.wait_for_shutdown() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    /// Republish running jobs without a live lease that are not active here.
    pub async fn reconcile_once(&self) -> Result<usize> {
        let orphaned = self.ctx.store.orphaned_jobs(Utc::now()).await?;
        let mut published = 0;
        for job_id in orphaned {
            if self.registry.contains(job_id) {
                continue;
            }
            info!(job_id = %job_id, "Republishing orphaned job");
            self.queue.publish(job_id).await?;
            published += 1;
        }
        Ok(published)
    }

    /// Run [`reconcile_once`](Self::reconcile_once) every reconcile interval
    /// until shutdown.
    pub async fn run_reconciler(&self) {
        let every = self.lease.reconcile_interval();
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = self.shutdown.wait_for_shutdown() => break,
                _ = ticker.tick() => {}
            }
            match self.reconcile_once().await {
                Ok(0) => {}
                Ok(published) => debug!(published, "Reconciler republished jobs"),
                Err(e) => warn!(error = %e, "Reconciliation failed"),
            }
        }
        debug!("Reconciler stopped");
    }
}
