//! Job-ready notifications with at-least-once delivery
//!
//! A [`Delivery`] stays unacknowledged until the dispatcher settles it with
//! [`ack`](NotificationQueue::ack) (done with it) or
//! [`nack`](NotificationQueue::nack) (deliver again). Consumers must tolerate
//! duplicates.

use crate::error::{Result, WorkerError};
use async_trait::async_trait;
use farescan_store::{JobId, JobStore};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Identifies one delivery for ack/nack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A job-ready notification handed to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job_id: JobId,
    pub tag: DeliveryTag,
    /// Whether this notification was handed out before
    pub redelivered: bool,
}

/// Durable at-least-once notification channel
#[async_trait]
pub trait NotificationQueue: Send + Sync {
    /// Announce that `job_id` is ready to run
    async fn publish(&self, job_id: JobId) -> Result<()>;

    /// Wait for the next notification
    async fn receive(&self) -> Result<Delivery>;

    /// Settle a delivery as handled
    async fn ack(&self, tag: DeliveryTag) -> Result<()>;

    /// Return a delivery for redelivery
    async fn nack(&self, tag: DeliveryTag) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    ready: VecDeque<(JobId, bool)>,
    unacked: HashMap<DeliveryTag, JobId>,
    next_tag: u64,
}

/// FIFO queue held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueue {
    state: Arc<Mutex<MemoryState>>,
    notify: Arc<Notify>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications waiting to be received
    pub fn ready_len(&self) -> usize {
        self.state.lock().ready.len()
    }

    /// Deliveries handed out and not yet settled
    pub fn unacked_len(&self) -> usize {
        self.state.lock().unacked.len()
    }

    fn try_pop(&self) -> Option<Delivery> {
        let mut state = self.state.lock();
        let (job_id, redelivered) = state.ready.pop_front()?;
        state.next_tag += 1;
        let tag = DeliveryTag(state.next_tag);
        state.unacked.insert(tag, job_id);
        Some(Delivery {
            job_id,
            tag,
            redelivered,
        })
    }
}

#[async_trait]
impl NotificationQueue for InMemoryQueue {
    async fn publish(&self, job_id: JobId) -> Result<()> {
        self.state.lock().ready.push_back((job_id, false));
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self) -> Result<Delivery> {
        loop {
            let notified = self.notify.notified();
            if let Some(delivery) = self.try_pop() {
                return Ok(delivery);
            }
            notified.await;
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        if self.state.lock().unacked.remove(&tag).is_none() {
            warn!(tag = %tag, "Ack for unknown delivery");
        }
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag) -> Result<()> {
        {
            let mut state = self.state.lock();
            match state.unacked.remove(&tag) {
                Some(job_id) => state.ready.push_back((job_id, true)),
                None => {
                    warn!(tag = %tag, "Nack for unknown delivery");
                    return Ok(());
                }
            }
        }
        self.notify.notify_one();
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PollingState {
    published: VecDeque<JobId>,
    in_flight: HashMap<DeliveryTag, JobId>,
    delivered_before: HashSet<JobId>,
    next_tag: u64,
}

impl PollingState {
    fn is_in_flight(&self, job_id: &JobId) -> bool {
        self.in_flight.values().any(|id| id == job_id)
    }
}

/// Queue derived from the job store itself
///
/// Pending jobs are always deliverable, so no notification is lost across a
/// restart. Published ids (orphan recovery) are delivered ahead of pending
/// jobs. A job with an unsettled delivery is not handed out again.
pub struct StorePollingQueue {
    store: Arc<dyn JobStore>,
    poll_interval: Duration,
    state: Mutex<PollingState>,
    notify: Notify,
}

impl StorePollingQueue {
    pub fn new(store: Arc<dyn JobStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
            state: Mutex::new(PollingState::default()),
            notify: Notify::new(),
        }
    }

    fn deliver(state: &mut PollingState, job_id: JobId) -> Delivery {
        state.next_tag += 1;
        let tag = DeliveryTag(state.next_tag);
        state.in_flight.insert(tag, job_id);
        let redelivered = !state.delivered_before.insert(job_id);
        Delivery {
            job_id,
            tag,
            redelivered,
        }
    }

    fn next_published(&self) -> Option<Delivery> {
        let mut state = self.state.lock();
        while let Some(job_id) = state.published.pop_front() {
            if !state.is_in_flight(&job_id) {
                return Some(Self::deliver(&mut state, job_id));
            }
        }
        None
    }
}

#[async_trait]
impl NotificationQueue for StorePollingQueue {
    async fn publish(&self, job_id: JobId) -> Result<()> {
        {
            let mut state = self.state.lock();
            if !state.published.contains(&job_id) {
                state.published.push_back(job_id);
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self) -> Result<Delivery> {
        loop {
            if let Some(delivery) = self.next_published() {
                return Ok(delivery);
            }

            let pending = self
                .store
                .pending_jobs()
                .await
                .map_err(|e| WorkerError::Queue(format!("polling pending jobs failed: {}", e)))?;
            {
                let mut state = self.state.lock();
                if let Some(job_id) = pending.into_iter().find(|id| !state.is_in_flight(id)) {
                    return Ok(Self::deliver(&mut state, job_id));
                }
            }

            debug!(poll_ms = self.poll_interval.as_millis() as u64, "No ready jobs");
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(job_id) = state.in_flight.remove(&tag) {
            state.delivered_before.remove(&job_id);
        }
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag) -> Result<()> {
        {
            let mut state = self.state.lock();
            let Some(job_id) = state.in_flight.remove(&tag) else {
                return Ok(());
            };
            if !state.published.contains(&job_id) {
                state.published.push_back(job_id);
            }
        }
        self.notify.notify_one();
        Ok(())
    }
}
