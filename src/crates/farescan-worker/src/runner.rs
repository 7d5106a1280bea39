//! Execution of one job from its checkpoint to a final state
//!
//! A [`JobRunner`] owns a job for the length of one run:
//!
//! ```text
//! Initializing -> Resuming -> Executing <-> Checkpointing
//!                                 |
//!                                 +-> Completing | Failing | Cancelling | Suspending
//! ```
//!
//! Units run in parallel under the job's [`JobGate`], but their outcomes are
//! committed strictly in combination order, so the checkpoint's
//! `processed_index` always covers a finished prefix. Dispatch never runs more
//! than `result_buffer` units ahead of that prefix, and stops entirely while a
//! failed checkpoint write is outstanding.

use crate::backend::FlightOffer;
use crate::config::WorkerSettings;
use crate::error::{Result, WorkerError};
use crate::events::{EventLogger, RunnerEvent};
use crate::executor::{SearchExecutor, UnitError, UnitOutcome};
use crate::limiter::{ConcurrencyLimiter, JobGate};
use crate::registry::{StopReason, StopSignal};
use crate::retry::{retry_with_backoff, RetryPolicy};
use farescan_store::{
    Checkpoint, Combination, FlightResult, JobId, JobRecord, JobStatus, JobStore,
    SearchConstraints, SearchParameters, StoreError,
};
use futures::FutureExt;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Runner tuning, usually taken from [`WorkerSettings`]
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerSettings {
    /// Committed units between checkpoint writes
    pub checkpoint_interval: u64,
    /// Consecutive failed writes before the job fails
    pub checkpoint_write_attempts: u32,
    /// Furthest dispatch may run ahead of the committed prefix
    pub result_buffer: usize,
    /// Pause before retrying a failed write
    pub store_retry_delay: Duration,
}

impl From<&WorkerSettings> for RunnerSettings {
    fn from(settings: &WorkerSettings) -> Self {
        Self {
            checkpoint_interval: settings.checkpoint_interval.max(1),
            checkpoint_write_attempts: settings.checkpoint_write_attempts.max(1),
            result_buffer: settings.result_buffer.max(1),
            store_retry_delay: Duration::from_millis(settings.store_retry_delay_ms),
        }
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from(&WorkerSettings::default())
    }
}

/// Everything a runner needs besides its job
#[derive(Clone)]
pub struct RunnerContext {
    pub store: Arc<dyn JobStore>,
    pub executor: SearchExecutor,
    pub limiter: ConcurrencyLimiter,
    pub settings: RunnerSettings,
    pub events: EventLogger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Initializing,
    Resuming,
    Executing,
    Checkpointing,
    Completing,
    Failing,
    Cancelling,
    Suspending,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunnerState::Initializing => "initializing",
            RunnerState::Resuming => "resuming",
            RunnerState::Executing => "executing",
            RunnerState::Checkpointing => "checkpointing",
            RunnerState::Completing => "completing",
            RunnerState::Failing => "failing",
            RunnerState::Cancelling => "cancelling",
            RunnerState::Suspending => "suspending",
        };
        f.write_str(s)
    }
}

/// Why a runner gave its job back unfinished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendReason {
    Shutdown,
    LeaseLost,
    /// Another writer saved a checkpoint for the job
    VersionConflict,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed { reason: String },
    Cancelled,
    /// Status left `running`; the job must be redelivered
    Suspended { reason: SuspendReason },
    /// The job was already finished when the runner loaded it
    AlreadyTerminal { status: JobStatus },
}

impl RunOutcome {
    /// Whether the job needs no further runs
    pub fn is_final(&self) -> bool {
        !matches!(self, RunOutcome::Suspended { .. })
    }
}

/// Per-route counters for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RouteStats {
    pub successes: u64,
    pub failures: u64,
    pub flights_found: u64,
    /// Mean price of the flights found on this route
    pub average_price: Option<f64>,
}

impl RouteStats {
    fn record(&mut self, outcome: &UnitOutcome) {
        match outcome {
            UnitOutcome::Found(offer) => {
                self.successes += 1;
                self.flights_found += 1;
                let mean = self.average_price.unwrap_or(0.0);
                self.average_price =
                    Some(mean + (offer.price - mean) / self.flights_found as f64);
            }
            UnitOutcome::NoMatch => self.successes += 1,
            UnitOutcome::Failed(_) => self.failures += 1,
        }
    }
}

/// Summary of one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub job_id: JobId,
    pub outcome: RunOutcome,
    /// Committed combinations, including those of earlier runs
    pub processed: u64,
    pub total: u64,
    pub found_flights: u64,
    pub failed_combinations: u64,
    pub best_price: Option<f64>,
    /// Counters for the units executed in this run, keyed `DEP-DST`
    pub route_stats: BTreeMap<String, RouteStats>,
}

/// Result of a checkpoint attempt or unit commit
enum Step {
    Continue,
    Exit(RunOutcome),
}

type UnitReport = (Combination, UnitOutcome);

struct Run {
    state: RunnerState,
    params: SearchParameters,
    total: u64,
    checkpoint: Checkpoint,
    persisted_index: u64,
    since_checkpoint: u64,
    write_failures: u32,
    write_pending: bool,
    /// Results stored past the checkpoint by an earlier run
    stored: BTreeMap<u64, FlightResult>,
    /// Indices in the reorder buffer that came from `stored`
    reused: BTreeSet<u64>,
    route_stats: BTreeMap<String, RouteStats>,
}

impl Run {
    fn new(record: JobRecord) -> Self {
        let persisted_index = record.checkpoint.processed_index;
        Self {
            state: RunnerState::Resuming,
            total: record.job.total_combinations,
            params: record.job.parameters,
            checkpoint: record.checkpoint,
            persisted_index,
            since_checkpoint: 0,
            write_failures: 0,
            write_pending: false,
            stored: BTreeMap::new(),
            reused: BTreeSet::new(),
            route_stats: BTreeMap::new(),
        }
    }

    fn enter(&mut self, state: RunnerState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Runner state change");
            self.state = state;
        }
    }

    fn has_unsaved_progress(&self) -> bool {
        self.checkpoint.processed_index > self.persisted_index
    }

    fn report(&self, job_id: JobId, outcome: RunOutcome) -> RunReport {
        RunReport {
            job_id,
            outcome,
            processed: self.checkpoint.processed_index,
            total: self.total,
            found_flights: self.checkpoint.found_flights,
            failed_combinations: self.checkpoint.failed_combinations,
            best_price: self.checkpoint.best_price,
            route_stats: self.route_stats.clone(),
        }
    }
}

/// Drives one job through its lifecycle
pub struct JobRunner {
    job_id: JobId,
    ctx: RunnerContext,
    stop: StopSignal,
    confirmed: Option<oneshot::Sender<()>>,
}

fn offer_of(result: &FlightResult) -> FlightOffer {
    FlightOffer {
        price: result.price,
        airline: result.airline.clone(),
        stops: result.stops,
        duration: result.duration.clone(),
        price_indicator: result.price_indicator,
    }
}

impl JobRunner {
    pub fn new(job_id: JobId, ctx: RunnerContext, stop: StopSignal) -> Self {
        Self {
            job_id,
            ctx,
            stop,
            confirmed: None,
        }
    }

    /// Signal `tx` once the resumed checkpoint has been re-saved under this
    /// runner's ownership.
    pub fn on_confirmed(mut self, tx: oneshot::Sender<()>) -> Self {
        self.confirmed = Some(tx);
        self
    }

    /// Run the job until it finishes or has to be given back.
    ///
    /// Errors are store failures before execution started; the job is left
    /// as it was and may be retried.
    pub async fn run(self) -> Result<RunReport> {
        let span = info_span!("job", job_id = %self.job_id);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(mut self) -> Result<RunReport> {
        let started = Instant::now();
        let store = self.ctx.store.clone();

        let record = store.load(self.job_id).await?;
        let status = record.job.status;
        if status.is_terminal() {
            info!(status = %status, "Job already finished, nothing to do");
            return Ok(Run::new(record).report(self.job_id, RunOutcome::AlreadyTerminal { status }));
        }
        if status == JobStatus::Pending {
            store.set_status(self.job_id, JobStatus::Running, None).await?;
        }

        let mut run = Run::new(record);
        if let Some(reason) = self.integrity_violation(&run) {
            let err = WorkerError::Integrity {
                job_id: self.job_id,
                reason,
            };
            let outcome = self.fail(&mut run, err.to_string(), false).await;
            return Ok(run.report(self.job_id, outcome));
        }

        let resume_from = run.checkpoint.processed_index;
        run.stored = store
            .results(self.job_id)
            .await?
            .into_iter()
            .filter(|r| r.combination_index >= resume_from)
            .map(|r| (r.combination_index, r))
            .collect();
        if !run.stored.is_empty() {
            info!(count = run.stored.len(), "Reusing results committed after the last checkpoint");
        }

        // Re-saving the loaded checkpoint proves no other writer moved it.
        match store
            .save_checkpoint(self.job_id, &run.checkpoint, run.checkpoint.version)
            .await
        {
            Ok(version) => run.checkpoint.version = version,
            Err(StoreError::VersionConflict { expected, actual, .. }) => {
                warn!(expected, actual, "Checkpoint moved under us while resuming");
                let outcome = self.suspend(&mut run, SuspendReason::VersionConflict, false).await;
                return Ok(run.report(self.job_id, outcome));
            }
            Err(StoreError::JobFinished { status, .. }) => {
                let outcome = self.finished_elsewhere(&mut run, status);
                return Ok(run.report(self.job_id, outcome));
            }
            Err(e) => return Err(e.into()),
        }
        if let Some(tx) = self.confirmed.take() {
            let _ = tx.send(());
        }

        info!(
            resume_from = run.checkpoint.processed_index,
            total = run.total,
            version = run.checkpoint.version,
            "Running job"
        );
        self.ctx.events.log(RunnerEvent::job_started(
            self.job_id,
            run.total,
            run.checkpoint.processed_index,
        ));

        let outcome = self.execute(&mut run, started).await?;
        Ok(run.report(self.job_id, outcome))
    }

    fn integrity_violation(&self, run: &Run) -> Option<String> {
        let derived = run.params.total_combinations();
        if run.total != derived {
            return Some(format!(
                "stored total {} does not match {} combinations derived from parameters",
                run.total, derived
            ));
        }
        if !run.checkpoint.is_within(run.total) {
            return Some(format!(
                "checkpoint index {} exceeds total {}",
                run.checkpoint.processed_index, run.total
            ));
        }
        None
    }

    async fn execute(&self, run: &mut Run, started: Instant) -> Result<RunOutcome> {
        run.enter(RunnerState::Executing);

        let gate = self.ctx.limiter.job_gate(run.params.max_concurrent_searches());
        let window = self.ctx.settings.result_buffer.max(gate.effective_limit());
        let (tx, mut rx) = mpsc::channel::<UnitReport>(window);
        let mut units = JoinSet::new();
        let mut ready: BTreeMap<u64, UnitReport> = BTreeMap::new();
        let mut next_dispatch = run.checkpoint.processed_index;
        let stop = self.stop.clone();

        let outcome = 'exec: loop {
            if let Some(reason) = stop.reason() {
                units.abort_all();
                ready.clear();
                break 'exec self.on_stop(run, reason).await;
            }

            while !run.write_pending
                && next_dispatch < run.total
                && next_dispatch - run.checkpoint.processed_index < window as u64
            {
                let Some(combination) = run.params.combination_at(next_dispatch) else {
                    let err = WorkerError::Integrity {
                        job_id: self.job_id,
                        reason: format!("no combination at index {}", next_dispatch),
                    };
                    units.abort_all();
                    break 'exec self.fail(run, err.to_string(), true).await;
                };
                if let Some(existing) = run.stored.remove(&next_dispatch) {
                    run.reused.insert(next_dispatch);
                    let outcome = UnitOutcome::Found(offer_of(&existing));
                    ready.insert(next_dispatch, (combination, outcome));
                } else {
                    self.spawn_unit(&mut units, &gate, combination, run.params.constraints, &tx);
                }
                next_dispatch += 1;
            }

            if ready.contains_key(&run.checkpoint.processed_index) {
                if let Step::Exit(outcome) = self.commit_ready(run, &mut ready).await {
                    units.abort_all();
                    break 'exec outcome;
                }
                continue;
            }

            if next_dispatch == run.checkpoint.processed_index {
                if run.write_pending {
                    tokio::select! {
                        biased;
                        _ = stop.tripped() => continue,
                        _ = tokio::time::sleep(self.ctx.settings.store_retry_delay) => {}
                    }
                    if let Step::Exit(outcome) = self.checkpoint(run).await {
                        break 'exec outcome;
                    }
                    continue;
                }
                if run.checkpoint.processed_index == run.total {
                    if run.persisted_index == run.total {
                        break 'exec self.complete(run, started).await?;
                    }
                    if let Step::Exit(outcome) = self.checkpoint(run).await {
                        break 'exec outcome;
                    }
                    continue;
                }
            }

            tokio::select! {
                biased;
                _ = stop.tripped() => continue,
                received = rx.recv() => {
                    if let Some((combination, outcome)) = received {
                        ready.insert(combination.index, (combination, outcome));
                    }
                    while units.try_join_next().is_some() {}
                    if let Step::Exit(outcome) = self.commit_ready(run, &mut ready).await {
                        units.abort_all();
                        break 'exec outcome;
                    }
                }
            }
        };

        units.abort_all();
        Ok(outcome)
    }

    fn spawn_unit(
        &self,
        units: &mut JoinSet<()>,
        gate: &JobGate,
        combination: Combination,
        constraints: SearchConstraints,
        tx: &mpsc::Sender<UnitReport>,
    ) {
        let gate = gate.clone();
        let executor = self.ctx.executor.clone();
        let tx = tx.clone();

        units.spawn(
            async move {
                let outcome = match gate.acquire().await {
                    Ok(_permit) => AssertUnwindSafe(executor.execute(&combination, &constraints))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            UnitOutcome::Failed(UnitError::Permanent("search panicked".into()))
                        }),
                    Err(e) => UnitOutcome::Failed(UnitError::Permanent(e.to_string())),
                };
                let _ = tx.send((combination, outcome)).await;
            }
            .in_current_span(),
        );
    }

    /// Commit the contiguous run of finished units at the front of `ready`.
    async fn commit_ready(&self, run: &mut Run, ready: &mut BTreeMap<u64, UnitReport>) -> Step {
        while !self.stop.is_tripped() {
            let Some((combination, outcome)) = ready.remove(&run.checkpoint.processed_index) else {
                break;
            };
            if let Err(e) = self.commit_unit(run, combination, outcome).await {
                return Step::Exit(self.fail(run, e.to_string(), true).await);
            }

            if !run.write_pending && run.since_checkpoint >= self.ctx.settings.checkpoint_interval {
                if let Step::Exit(outcome) = self.checkpoint(run).await {
                    return Step::Exit(outcome);
                }
            }
        }
        Step::Continue
    }

    async fn commit_unit(&self, run: &mut Run, combination: Combination, outcome: UnitOutcome) -> Result<()> {
        let index = combination.index;
        match &outcome {
            UnitOutcome::Found(offer) => {
                let mut price = offer.price;
                if !run.reused.remove(&index) {
                    let result = FlightResult::for_combination(
                        self.job_id,
                        &combination,
                        offer.price,
                        offer.airline.clone(),
                        offer.stops,
                        offer.duration.clone(),
                        offer.price_indicator,
                    );
                    if !self.append_result(result).await? {
                        price = self.stored_price(index).await?.unwrap_or(price);
                        debug!(index, price, "Result from an earlier run kept");
                    }
                }
                run.checkpoint.found_flights += 1;
                if run.checkpoint.record_price(price) {
                    debug!(index, price, "New best price");
                }
            }
            UnitOutcome::NoMatch => {}
            UnitOutcome::Failed(e) => {
                run.checkpoint.failed_combinations += 1;
                warn!(index, combination = %combination, error = %e, "Combination failed, skipping");
                self.ctx
                    .events
                    .log(RunnerEvent::unit_failed(self.job_id, index, e.to_string()));
            }
        }

        run.route_stats
            .entry(combination.route_key())
            .or_default()
            .record(&outcome);
        run.checkpoint.processed_index += 1;
        run.since_checkpoint += 1;
        Ok(())
    }

    /// Price of the result already stored for `index`, if any
    async fn stored_price(&self, index: u64) -> Result<Option<f64>> {
        let results = self.ctx.store.results(self.job_id).await?;
        Ok(results
            .into_iter()
            .find(|r| r.combination_index == index)
            .map(|r| r.price))
    }

    async fn append_result(&self, result: FlightResult) -> Result<bool> {
        let settings = &self.ctx.settings;
        let policy = RetryPolicy {
            max_retries: settings.checkpoint_write_attempts.saturating_sub(1),
            initial_backoff: settings.store_retry_delay,
            max_backoff: settings.store_retry_delay * 4,
            multiplier: 2.0,
            jitter: false,
        };
        let store = self.ctx.store.clone();
        let attempts = settings.checkpoint_write_attempts;

        retry_with_backoff(&policy, "append_result", move |_| {
            let store = store.clone();
            let result = result.clone();
            async move { store.append_result(result).await }
        })
        .await
        .map_err(|e| WorkerError::StoreUnavailable {
            job_id: self.job_id,
            attempts,
            message: e.to_string(),
        })
    }

    async fn checkpoint(&self, run: &mut Run) -> Step {
        run.enter(RunnerState::Checkpointing);
        let index = run.checkpoint.processed_index;

        let step = match self
            .ctx
            .store
            .save_checkpoint(self.job_id, &run.checkpoint, run.checkpoint.version)
            .await
        {
            Ok(version) => {
                run.checkpoint.version = version;
                run.persisted_index = index;
                run.since_checkpoint = 0;
                run.write_failures = 0;
                run.write_pending = false;
                info!(processed = index, total = run.total, version, "Checkpoint saved");
                self.ctx
                    .events
                    .log(RunnerEvent::checkpoint_saved(self.job_id, index, version));
                self.observe_cancellation().await;
                Step::Continue
            }
            Err(StoreError::VersionConflict { expected, actual, .. }) => {
                warn!(expected, actual, "Checkpoint version conflict, another writer owns this job");
                Step::Exit(self.suspend(run, SuspendReason::VersionConflict, false).await)
            }
            Err(StoreError::JobFinished { status, .. }) => {
                Step::Exit(self.finished_elsewhere(run, status))
            }
            Err(e) => {
                run.write_failures += 1;
                warn!(
                    processed = index,
                    attempt = run.write_failures,
                    error = %e,
                    "Checkpoint write failed"
                );
                self.ctx.events.log(RunnerEvent::checkpoint_failed(
                    self.job_id,
                    index,
                    run.write_failures,
                    e.to_string(),
                ));

                if run.write_failures >= self.ctx.settings.checkpoint_write_attempts {
                    let err = WorkerError::StoreUnavailable {
                        job_id: self.job_id,
                        attempts: run.write_failures,
                        message: e.to_string(),
                    };
                    Step::Exit(self.fail(run, err.to_string(), false).await)
                } else {
                    run.write_pending = true;
                    Step::Continue
                }
            }
        };

        if matches!(step, Step::Continue) {
            run.enter(RunnerState::Executing);
        }
        step
    }

    /// Pick up a cancellation written by another process.
    async fn observe_cancellation(&self) {
        match self.ctx.store.load(self.job_id).await {
            Ok(record) if record.job.status == JobStatus::Cancelled => {
                info!("Cancellation observed in store");
                self.stop.trip(StopReason::Cancelled);
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Status poll failed"),
        }
    }

    /// Save unsaved progress once, ignoring failure.
    async fn persist_best_effort(&self, run: &mut Run) {
        if !run.has_unsaved_progress()
            || run.write_failures >= self.ctx.settings.checkpoint_write_attempts
        {
            return;
        }
        match self
            .ctx
            .store
            .save_checkpoint(self.job_id, &run.checkpoint, run.checkpoint.version)
            .await
        {
            Ok(version) => {
                run.checkpoint.version = version;
                run.persisted_index = run.checkpoint.processed_index;
                self.ctx.events.log(RunnerEvent::checkpoint_saved(
                    self.job_id,
                    run.persisted_index,
                    version,
                ));
            }
            Err(StoreError::JobFinished { status, .. }) => {
                debug!(status = %status, "Job already finished, progress not saved")
            }
            Err(e) => warn!(
                processed = run.checkpoint.processed_index,
                persisted = run.persisted_index,
                error = %e,
                "Could not persist final checkpoint"
            ),
        }
    }

    /// The store refused a checkpoint because the job was finished by
    /// someone else, usually a cancellation from another process.
    fn finished_elsewhere(&self, run: &mut Run, status: JobStatus) -> RunOutcome {
        if status != JobStatus::Cancelled {
            warn!(status = %status, "Job finished elsewhere, dropping unsaved progress");
            return RunOutcome::AlreadyTerminal { status };
        }
        run.enter(RunnerState::Cancelling);
        info!(processed = run.persisted_index, "Cancellation observed in store");
        self.ctx
            .events
            .log(RunnerEvent::job_cancelled(self.job_id, run.persisted_index));
        RunOutcome::Cancelled
    }

    async fn on_stop(&self, run: &mut Run, reason: StopReason) -> RunOutcome {
        match reason {
            StopReason::Cancelled => self.cancel(run).await,
            StopReason::Shutdown => self.suspend(run, SuspendReason::Shutdown, true).await,
            StopReason::LeaseLost => self.suspend(run, SuspendReason::LeaseLost, false).await,
        }
    }

    async fn cancel(&self, run: &mut Run) -> RunOutcome {
        run.enter(RunnerState::Cancelling);
        self.persist_best_effort(run).await;
        if let Err(e) = self
            .ctx
            .store
            .set_status(self.job_id, JobStatus::Cancelled, None)
            .await
        {
            warn!(error = %e, "Could not record cancellation");
        }
        info!(processed = run.persisted_index, "Job cancelled");
        self.ctx
            .events
            .log(RunnerEvent::job_cancelled(self.job_id, run.persisted_index));
        RunOutcome::Cancelled
    }

    async fn suspend(&self, run: &mut Run, reason: SuspendReason, persist: bool) -> RunOutcome {
        run.enter(RunnerState::Suspending);
        if persist {
            self.persist_best_effort(run).await;
        }
        info!(reason = ?reason, processed = run.persisted_index, "Suspending job");
        self.ctx
            .events
            .log(RunnerEvent::job_suspended(self.job_id, format!("{:?}", reason)));
        RunOutcome::Suspended { reason }
    }

    async fn fail(&self, run: &mut Run, reason: String, persist: bool) -> RunOutcome {
        run.enter(RunnerState::Failing);
        if persist {
            self.persist_best_effort(run).await;
        }
        error!(reason = %reason, processed = run.persisted_index, "Job failed");
        if let Err(e) = self
            .ctx
            .store
            .set_status(self.job_id, JobStatus::Failed, Some(reason.clone()))
            .await
        {
            error!(error = %e, "Could not record job failure");
        }
        self.ctx.events.log(RunnerEvent::job_failed(self.job_id, reason.clone()));
        RunOutcome::Failed { reason }
    }

    async fn complete(&self, run: &mut Run, started: Instant) -> Result<RunOutcome> {
        run.enter(RunnerState::Completing);
        match self
            .ctx
            .store
            .set_status(self.job_id, JobStatus::Completed, None)
            .await
        {
            Ok(()) => {}
            Err(StoreError::InvalidTransition { from, .. }) => {
                warn!(status = %from, "Job finished after its status changed");
                return Ok(match from {
                    JobStatus::Cancelled => RunOutcome::Cancelled,
                    status => RunOutcome::AlreadyTerminal { status },
                });
            }
            Err(e) => return Err(e.into()),
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            processed = run.checkpoint.processed_index,
            found_flights = run.checkpoint.found_flights,
            failed = run.checkpoint.failed_combinations,
            best_price = ?run.checkpoint.best_price,
            duration_ms,
            "Job completed"
        );
        for (route, stats) in &run.route_stats {
            info!(
                route = %route,
                successes = stats.successes,
                failures = stats.failures,
                flights_found = stats.flights_found,
                average_price = ?stats.average_price,
                "Route summary"
            );
        }
        self.ctx.events.log(RunnerEvent::job_completed(
            self.job_id,
            run.checkpoint.processed_index,
            run.checkpoint.found_flights,
            run.checkpoint.failed_combinations,
            duration_ms,
        ));
        Ok(RunOutcome::Completed)
    }
}
