//! Two-level concurrency admission for search units
//!
//! Every unit passes two gates before it may call the search backend: its
//! job's gate (`max_concurrent_searches`) and the process-wide gate
//! (`worker.concurrency`). Both are FIFO tokio semaphores, acquired in that
//! order. The resulting [`UnitPermit`] gives both back when dropped, whatever
//! path the unit takes out.

use crate::error::{Result, WorkerError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Current and peak occupancy of a gate
#[derive(Debug, Default)]
pub struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    pub(crate) fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub(crate) fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Process-wide gate shared by every job in this worker
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    global: Arc<Semaphore>,
    limit: usize,
    gauge: Arc<Gauge>,
}

impl ConcurrencyLimiter {
    pub fn new(global_limit: usize) -> Self {
        let limit = global_limit.max(1);
        Self {
            global: Arc::new(Semaphore::new(limit)),
            limit,
            gauge: Arc::new(Gauge::default()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Units executing across all jobs
    pub fn in_flight(&self) -> usize {
        self.gauge.current()
    }

    pub fn peak(&self) -> usize {
        self.gauge.peak()
    }

    /// A gate for one job admitting at most `job_limit` units at a time
    pub fn job_gate(&self, job_limit: usize) -> JobGate {
        let limit = job_limit.max(1);
        JobGate {
            job: Arc::new(Semaphore::new(limit)),
            limit,
            gauge: Arc::new(Gauge::default()),
            global: self.clone(),
        }
    }
}

/// Per-job gate layered over the process-wide one
#[derive(Debug, Clone)]
pub struct JobGate {
    job: Arc<Semaphore>,
    limit: usize,
    gauge: Arc<Gauge>,
    global: ConcurrencyLimiter,
}

impl JobGate {
    /// Wait for the job gate, then the global gate.
    pub async fn acquire(&self) -> Result<UnitPermit> {
        let job = self
            .job
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::LimiterClosed)?;
        let global = self
            .global
            .global
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::LimiterClosed)?;

        self.gauge.enter();
        self.global.gauge.enter();
        Ok(UnitPermit {
            _job: job,
            _global: global,
            job_gauge: self.gauge.clone(),
            global_gauge: self.global.gauge.clone(),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// The most units of this job that can ever run at once
    pub fn effective_limit(&self) -> usize {
        self.limit.min(self.global.limit)
    }

    pub fn in_flight(&self) -> usize {
        self.gauge.current()
    }

    pub fn peak(&self) -> usize {
        self.gauge.peak()
    }
}

/// Admission to run one unit; releases both gates on drop
#[derive(Debug)]
pub struct UnitPermit {
    _job: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
    job_gauge: Arc<Gauge>,
    global_gauge: Arc<Gauge>,
}

impl Drop for UnitPermit {
    fn drop(&mut self) {
        self.job_gauge.exit();
        self.global_gauge.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_job_gate_caps_at_min_of_limits() {
        let limiter = ConcurrencyLimiter::new(4);
        let gate = limiter.job_gate(2);
        assert_eq!(gate.effective_limit(), 2);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire().await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(gate.peak(), 2);
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_gate_is_shared_between_jobs() {
        let limiter = ConcurrencyLimiter::new(3);
        let gates = [limiter.job_gate(3), limiter.job_gate(3)];

        let mut handles = Vec::new();
        for i in 0..12 {
            let gate = gates[i % 2].clone();
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire().await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(limiter.peak(), 3);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_permit_released_on_early_exit() {
        let limiter = ConcurrencyLimiter::new(1);
        let gate = limiter.job_gate(1);

        let result: std::result::Result<(), &str> = async {
            let _permit = gate.acquire().await.unwrap();
            Err("unit failed")
        }
        .await;
        assert!(result.is_err());

        // Would hang if the failed unit had leaked its permit.
        let permit = tokio::time::timeout(Duration::from_secs(1), gate.acquire())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(limiter.in_flight(), 1);
        drop(permit);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[test]
    fn test_zero_limits_are_raised() {
        let limiter = ConcurrencyLimiter::new(0);
        assert_eq!(limiter.limit(), 1);
        assert_eq!(limiter.job_gate(0).limit(), 1);
    }
}
