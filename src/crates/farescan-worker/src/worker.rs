//! Wiring of a worker process from its configuration

use crate::backend::SearchBackend;
use crate::config::{StoreFormat, StoreSettings, WorkerConfig};
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::events::EventLogger;
use crate::executor::SearchExecutor;
use crate::limiter::ConcurrencyLimiter;
use crate::queue::{NotificationQueue, StorePollingQueue};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::runner::{RunnerContext, RunnerSettings};
use crate::shutdown::ShutdownCoordinator;
use crate::status::StatusService;
use farescan_store::{BincodeSerializer, FileJobStore, JobStore, JsonSerializer};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Open the file job store described by `settings`
pub async fn open_store(settings: &StoreSettings) -> Result<Arc<dyn JobStore>> {
    let store: Arc<dyn JobStore> = match settings.format {
        StoreFormat::Bincode => {
            Arc::new(FileJobStore::with_serializer(settings.path.clone(), BincodeSerializer).await?)
        }
        StoreFormat::Json => {
            Arc::new(FileJobStore::with_serializer(settings.path.clone(), JsonSerializer).await?)
        }
    };
    Ok(store)
}

/// A configured worker: dispatcher, reconciler and status service over one
/// store
pub struct Worker {
    store: Arc<dyn JobStore>,
    dispatcher: Dispatcher,
    status: StatusService,
    shutdown: ShutdownCoordinator,
}

impl Worker {
    /// Build a worker over the file store and a store-polling queue.
    pub async fn from_config(config: &WorkerConfig, backend: Arc<dyn SearchBackend>) -> Result<Self> {
        let store = open_store(&config.store).await?;
        let queue = Arc::new(StorePollingQueue::new(
            store.clone(),
            Duration::from_millis(config.store.poll_interval_ms),
        ));
        Ok(Self::new(config, store, queue, backend, ShutdownCoordinator::new()))
    }

    pub fn new(
        config: &WorkerConfig,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn NotificationQueue>,
        backend: Arc<dyn SearchBackend>,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        let settings = &config.worker;
        let executor = SearchExecutor::new(
            backend,
            RateLimiter::new(settings.rate_limit, Duration::from_secs(settings.time_window_secs)),
            RetryPolicy::from(&config.retry),
            Duration::from_secs(settings.unit_timeout_secs),
        );
        let ctx = RunnerContext {
            store: store.clone(),
            executor,
            limiter: ConcurrencyLimiter::new(settings.concurrency),
            settings: RunnerSettings::from(settings),
            events: EventLogger::default(),
        };

        let infra_retry = RetryPolicy {
            max_retries: u32::MAX,
            initial_backoff: Duration::from_millis(settings.store_retry_delay_ms),
            max_backoff: Duration::from_millis(config.retry.max_delay_ms),
            multiplier: config.retry.multiplier,
            jitter: true,
        };
        let dispatcher = Dispatcher::new(ctx, queue, config.worker_id(), config.lease.clone(), shutdown.clone())
            .with_infra_backoff(infra_retry, settings.infra_error_threshold);

        Self {
            status: StatusService::new(store.clone()),
            store,
            dispatcher,
            shutdown,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn status(&self) -> &StatusService {
        &self.status
    }

    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Run dispatcher and reconciler until shutdown is requested.
    pub async fn run(&self) -> Result<()> {
        info!(owner = %self.dispatcher.owner(), "Worker running");
        let (dispatched, ()) = tokio::join!(self.dispatcher.run(), self.dispatcher.run_reconciler());
        dispatched
    }
}
