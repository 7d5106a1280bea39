//! # farescan-worker - background execution engine for fare search jobs
//!
//! Pulls queued jobs, fans each one out into search units under a two-level
//! concurrency limit, commits their outcomes in order with periodic
//! checkpoints, and recovers jobs abandoned by crashed workers.
//!
//! ## Components
//!
//! - [`Dispatcher`] - claims jobs from a [`NotificationQueue`] with a lease and
//!   supervises their runners; its reconciler republishes orphaned jobs
//! - [`JobRunner`] - drives one job from its checkpoint to a final state
//! - [`SearchExecutor`] - one unit: rate limiting, retries, offer selection
//! - [`ConcurrencyLimiter`] - per-job and process-wide admission
//! - [`StatusService`] - client view of job progress
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use farescan_worker::{SimulatedBackend, Worker, WorkerConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> farescan_worker::Result<()> {
//! let config = WorkerConfig::default();
//! let worker = Worker::from_config(&config, Arc::new(SimulatedBackend::default())).await?;
//! worker.shutdown().install_signal_handlers();
//! worker.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod executor;
pub mod limiter;
pub mod queue;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod shutdown;
pub mod status;
pub mod telemetry;
pub mod testing;
pub mod worker;

pub use backend::{BackendError, FlightOffer, SearchBackend, SearchRequest, SimulatedBackend};
pub use config::{load_config, ConfigLoader, WorkerConfig};
pub use dispatcher::{cancel_job, CancelOutcome, Dispatch, Dispatcher, DropReason};
pub use error::{Result, WorkerError};
pub use events::{EventLogger, RunnerEvent};
pub use executor::{SearchExecutor, UnitError, UnitOutcome};
pub use limiter::{ConcurrencyLimiter, JobGate, UnitPermit};
pub use queue::{Delivery, DeliveryTag, InMemoryQueue, NotificationQueue, StorePollingQueue};
pub use rate_limit::RateLimiter;
pub use registry::{ActiveJobs, StopReason, StopSignal};
pub use retry::{retry_with_backoff, Classify, ErrorClass, RetryPolicy};
pub use runner::{
    JobRunner, RouteStats, RunOutcome, RunReport, RunnerContext, RunnerSettings, RunnerState,
    SuspendReason,
};
pub use shutdown::{ShutdownCause, ShutdownCoordinator};
pub use status::{StatusError, StatusService};
pub use telemetry::init_tracing;
pub use worker::{open_store, Worker};
