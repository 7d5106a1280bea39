//! Jobs currently executing in this process
//!
//! The registry guarantees a job runs at most once per worker, and holds the
//! [`StopSignal`] through which a running job is cancelled, suspended for
//! shutdown, or abandoned after losing its lease.

use farescan_store::JobId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;

/// Why a running job was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A client cancelled the job
    Cancelled,
    /// The worker is shutting down
    Shutdown,
    /// Another worker may now own the job
    LeaseLost,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Cancelled => "cancelled",
            StopReason::Shutdown => "shutdown",
            StopReason::LeaseLost => "lease lost",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
struct StopState {
    reason: Mutex<Option<StopReason>>,
    notify: Notify,
}

/// One-shot stop request shared between a runner and its supervisors
///
/// The first reason wins; later trips are ignored.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    state: Arc<StopState>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. Returns false if one was already requested.
    pub fn trip(&self, reason: StopReason) -> bool {
        {
            let mut current = self.state.reason.lock();
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
        }
        self.state.notify.notify_waiters();
        true
    }

    pub fn reason(&self) -> Option<StopReason> {
        *self.state.reason.lock()
    }

    pub fn is_tripped(&self) -> bool {
        self.reason().is_some()
    }

    /// Wait until a stop is requested
    pub async fn tripped(&self) -> StopReason {
        loop {
            let notified = self.state.notify.notified();
            if let Some(reason) = self.reason() {
                return reason;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone)]
struct ActiveJob {
    owner: String,
    stop: StopSignal,
}

/// Registry of running jobs
#[derive(Debug, Clone, Default)]
pub struct ActiveJobs {
    jobs: Arc<Mutex<HashMap<JobId, ActiveJob>>>,
}

impl ActiveJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `job_id`, or return `None` if it is already running here.
    pub fn try_register(&self, job_id: JobId, owner: &str) -> Option<StopSignal> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job_id) {
            return None;
        }
        let stop = StopSignal::new();
        jobs.insert(
            job_id,
            ActiveJob {
                owner: owner.to_string(),
                stop: stop.clone(),
            },
        );
        Some(stop)
    }

    pub fn stop_signal(&self, job_id: JobId) -> Option<StopSignal> {
        self.jobs.lock().get(&job_id).map(|job| job.stop.clone())
    }

    pub fn owner(&self, job_id: JobId) -> Option<String> {
        self.jobs.lock().get(&job_id).map(|job| job.owner.clone())
    }

    pub fn remove(&self, job_id: JobId) -> bool {
        self.jobs.lock().remove(&job_id).is_some()
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.jobs.lock().contains_key(&job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.jobs.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Trip the stop signal of `job_id` if it runs here
    pub fn stop(&self, job_id: JobId, reason: StopReason) -> bool {
        match self.stop_signal(job_id) {
            Some(stop) => stop.trip(reason),
            None => false,
        }
    }

    /// Trip every registered job's stop signal
    pub fn stop_all(&self, reason: StopReason) {
        let signals: Vec<StopSignal> = self.jobs.lock().values().map(|job| job.stop.clone()).collect();
        for stop in signals {
            stop.trip(reason);
        }
    }
}
