//! Common test utilities and setup

#![allow(dead_code)]

use farescan_store::{JobId, JobRecord, JobStore, SearchParameters};
use farescan_worker::testing::{fixtures, ScriptedBackend, ScriptedResponse};
use farescan_worker::{
    ConcurrencyLimiter, EventLogger, RateLimiter, RetryPolicy, RunnerContext, RunnerSettings,
    SearchBackend, SearchExecutor, SearchRequest,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Runner settings with short retry delays
pub fn settings(checkpoint_interval: u64) -> RunnerSettings {
    RunnerSettings {
        checkpoint_interval,
        checkpoint_write_attempts: 3,
        result_buffer: 4,
        store_retry_delay: Duration::from_millis(10),
    }
}

/// Runner context over `store` and `backend` with a process-wide limit of
/// `global_limit` and a recording event logger
pub fn context(
    store: Arc<dyn JobStore>,
    backend: Arc<dyn SearchBackend>,
    global_limit: usize,
    settings: RunnerSettings,
) -> RunnerContext {
    RunnerContext {
        store,
        executor: SearchExecutor::new(
            backend,
            RateLimiter::new(10_000, Duration::from_secs(1)),
            RetryPolicy::immediate(2),
            Duration::from_secs(60),
        ),
        limiter: ConcurrencyLimiter::new(global_limit),
        settings,
        events: EventLogger::recording(),
    }
}

/// Combination index of every request key of `params`
pub fn index_by_key(params: &SearchParameters) -> HashMap<String, u64> {
    params
        .combinations()
        .map(|c| (SearchRequest::for_combination(&c, params.constraints).key(), c.index))
        .collect()
}

/// Price offered for the combination at `index`
pub fn price_for(index: u64) -> f64 {
    400.0 + 10.0 * index as f64
}

/// Backend answering one offer priced by [`price_for`] for every combination
/// of `params`, delegating to `other` for the indices it picks
pub fn priced_backend<F>(params: &SearchParameters, other: F) -> ScriptedBackend
where
    F: Fn(u64, u32) -> Option<ScriptedResponse> + Send + Sync + 'static,
{
    let indices = index_by_key(params);
    ScriptedBackend::new(move |request, attempt| {
        let index = indices.get(&request.key()).copied().unwrap_or(u64::MAX);
        other(index, attempt)
            .unwrap_or_else(|| ScriptedResponse::Offers(vec![fixtures::offer(price_for(index))]))
    })
}

/// Poll `condition` until it holds, panicking after ten seconds
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}

/// Poll the store until the job's checkpoint reaches `index`
pub async fn wait_for_checkpoint(store: &Arc<dyn JobStore>, job_id: JobId, index: u64) {
    wait_until(&format!("checkpoint at {}", index), || async move {
        load(store, job_id).await.checkpoint.processed_index >= index
    })
    .await;
}

pub async fn load(store: &Arc<dyn JobStore>, job_id: JobId) -> JobRecord {
    store.load(job_id).await.expect("job should load")
}
