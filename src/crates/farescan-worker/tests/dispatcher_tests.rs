//! Dispatcher scenarios: delivery handling, lease ownership, recovery of
//! orphaned jobs and shutdown

mod common;

use chrono::Utc;
use common::{context, load, priced_backend, settings, wait_for_checkpoint, wait_until};
use farescan_store::{InMemoryJobStore, JobId, JobStatus, JobStore, Lease};
use farescan_worker::config::LeaseSettings;
use farescan_worker::testing::{fixtures, FlakyStore, ScriptedBackend};
use farescan_worker::{
    CancelOutcome, Dispatch, Dispatcher, DropReason, InMemoryQueue, NotificationQueue, RetryPolicy,
    RunOutcome, SearchBackend, ShutdownCoordinator, StatusService, StorePollingQueue,
    SuspendReason,
};
use std::sync::Arc;
use std::time::Duration;

fn lease_settings() -> LeaseSettings {
    LeaseSettings {
        ttl_secs: 30,
        renew_interval_secs: 1,
        reconcile_interval_secs: 1,
    }
}

fn dispatcher(
    store: Arc<dyn JobStore>,
    backend: Arc<dyn SearchBackend>,
    queue: Arc<dyn NotificationQueue>,
    owner: &str,
) -> Dispatcher {
    Dispatcher::new(
        context(store, backend, 4, settings(2)),
        queue,
        owner,
        lease_settings(),
        ShutdownCoordinator::new(),
    )
    .with_infra_backoff(RetryPolicy::immediate(u32::MAX), 3)
}

async fn deliver(dispatcher: &Dispatcher, queue: &InMemoryQueue, job_id: JobId) -> Dispatch {
    queue.publish(job_id).await.unwrap();
    let delivery = queue.receive().await.unwrap();
    assert_eq!(delivery.job_id, job_id);
    dispatcher.handle_delivery(delivery).await.unwrap()
}

fn started(dispatch: Dispatch) -> tokio::task::JoinHandle<Option<farescan_worker::RunReport>> {
    match dispatch {
        Dispatch::Started(handle) => handle,
        other => panic!("expected a runner to start, got {:?}", other),
    }
}

#[tokio::test]
async fn test_duplicate_deliveries_start_one_runner() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let params = fixtures::one_way_params(6);
    let job = store.create_job(params.clone()).await.unwrap();
    let backend = Arc::new(priced_backend(&params, |_, _| None).with_latency(Duration::from_millis(20)));
    let queue = InMemoryQueue::new();
    let d = dispatcher(store.clone(), backend.clone(), Arc::new(queue.clone()), "worker-a");

    let handle = started(deliver(&d, &queue, job.job_id).await);
    assert!(matches!(
        deliver(&d, &queue, job.job_id).await,
        Dispatch::Dropped(DropReason::AlreadyActive)
    ));
    assert!(matches!(
        deliver(&d, &queue, job.job_id).await,
        Dispatch::Dropped(DropReason::AlreadyActive)
    ));

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(backend.call_count(), 6);
    assert!(d.registry().is_empty());
    assert_eq!(queue.ready_len(), 0);
    assert_eq!(queue.unacked_len(), 0);

    let record = load(&store, job.job_id).await;
    assert_eq!(record.job.status, JobStatus::Completed);
    assert!(record.lease.is_none());

    assert!(matches!(
        deliver(&d, &queue, job.job_id).await,
        Dispatch::Dropped(DropReason::Terminal(JobStatus::Completed))
    ));
}

#[tokio::test]
async fn test_second_worker_is_turned_away_by_lease() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let params = fixtures::one_way_params(6);
    let job = store.create_job(params.clone()).await.unwrap();
    let backend = Arc::new(priced_backend(&params, |_, _| None).with_latency(Duration::from_millis(20)));

    let queue_a = InMemoryQueue::new();
    let queue_b = InMemoryQueue::new();
    let a = dispatcher(store.clone(), backend.clone(), Arc::new(queue_a.clone()), "worker-a");
    let b = dispatcher(store.clone(), backend.clone(), Arc::new(queue_b.clone()), "worker-b");

    let handle = started(deliver(&a, &queue_a, job.job_id).await);
    match deliver(&b, &queue_b, job.job_id).await {
        Dispatch::Dropped(DropReason::LeaseHeld { holder }) => assert_eq!(holder, "worker-a"),
        other => panic!("expected lease rejection, got {:?}", other),
    }
    assert_eq!(queue_b.unacked_len(), 0);
    assert!(b.registry().is_empty());

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(backend.call_count(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_lost_lease_suspends_without_releasing() {
    let memory = Arc::new(InMemoryJobStore::new());
    let store: Arc<dyn JobStore> = memory.clone();
    let params = fixtures::one_way_params(20).with_max_concurrent_searches(1);
    let job = store.create_job(params.clone()).await.unwrap();
    let backend = Arc::new(priced_backend(&params, |_, _| None).with_latency(Duration::from_secs(1)));
    let queue = InMemoryQueue::new();
    let d = Dispatcher::new(
        context(store.clone(), backend, 4, settings(100)),
        Arc::new(queue.clone()),
        "worker-a",
        lease_settings(),
        ShutdownCoordinator::new(),
    );

    let handle = started(deliver(&d, &queue, job.job_id).await);
    let (watched, job_id) = (&store, job.job_id);
    wait_until("resume confirmation", || async move {
        load(watched, job_id).await.checkpoint.version >= 1
    })
    .await;

    // Another worker takes the job over behind our back.
    let mut record = load(&store, job.job_id).await;
    record.lease = Some(Lease {
        job_id: job.job_id,
        owner: "worker-b".into(),
        expires_at: Utc::now() + chrono::Duration::minutes(5),
    });
    memory.insert_record(record).await;

    let report = handle.await.unwrap().unwrap();
    assert_eq!(
        report.outcome,
        RunOutcome::Suspended {
            reason: SuspendReason::LeaseLost
        }
    );

    let record = load(&store, job.job_id).await;
    assert_eq!(record.job.status, JobStatus::Running);
    assert_eq!(record.lease.map(|l| l.owner), Some("worker-b".to_string()));
    assert!(d.registry().is_empty());
    assert_eq!(queue.unacked_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_local_runner() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let params = fixtures::one_way_params(20).with_max_concurrent_searches(1);
    let job = store.create_job(params.clone()).await.unwrap();
    let backend = Arc::new(priced_backend(&params, |_, _| None).with_latency(Duration::from_secs(1)));
    let queue = InMemoryQueue::new();
    let d = dispatcher(store.clone(), backend.clone(), Arc::new(queue.clone()), "worker-a");

    let handle = started(deliver(&d, &queue, job.job_id).await);
    wait_for_checkpoint(&store, job.job_id, 2).await;

    assert_eq!(
        d.cancel(job.job_id).await.unwrap(),
        CancelOutcome::Cancelled {
            stopped_runner: true
        }
    );
    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);

    let record = load(&store, job.job_id).await;
    assert_eq!(record.job.status, JobStatus::Cancelled);
    assert!(record.lease.is_none());
    assert!(record.checkpoint.processed_index < 20);
    assert_eq!(queue.unacked_len(), 0);

    assert_eq!(
        d.cancel(job.job_id).await.unwrap(),
        CancelOutcome::AlreadyFinished(JobStatus::Cancelled)
    );
}

#[tokio::test]
async fn test_store_outage_defers_delivery() {
    let inner: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let flaky = Arc::new(FlakyStore::new(inner));
    let store: Arc<dyn JobStore> = flaky.clone();
    let params = fixtures::one_way_params(2);
    let job = store.create_job(params.clone()).await.unwrap();
    let queue = InMemoryQueue::new();
    let d = dispatcher(
        store.clone(),
        Arc::new(priced_backend(&params, |_, _| None)),
        Arc::new(queue.clone()),
        "worker-a",
    );

    flaky.set_unavailable(true);
    assert!(matches!(deliver(&d, &queue, job.job_id).await, Dispatch::Deferred));
    assert_eq!(d.infra_errors(), 1);
    assert_eq!(queue.ready_len(), 1);
    assert_eq!(queue.unacked_len(), 0);

    flaky.set_unavailable(false);
    let redelivery = queue.receive().await.unwrap();
    assert!(redelivery.redelivered);
    let handle = started(d.handle_delivery(redelivery).await.unwrap());
    assert_eq!(d.infra_errors(), 0);

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
}

#[tokio::test]
async fn test_unknown_job_is_acknowledged() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let queue = InMemoryQueue::new();
    let d = dispatcher(
        store,
        Arc::new(ScriptedBackend::always(vec![])),
        Arc::new(queue.clone()),
        "worker-a",
    );

    assert!(matches!(
        deliver(&d, &queue, JobId::new()).await,
        Dispatch::Dropped(DropReason::NotFound)
    ));
    assert_eq!(queue.ready_len(), 0);
    assert_eq!(queue.unacked_len(), 0);
}

#[tokio::test]
async fn test_reconciler_republishes_only_orphans() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let orphan = store.create_job(fixtures::one_way_params(2)).await.unwrap();
    let leased = store.create_job(fixtures::one_way_params(2)).await.unwrap();
    let pending = store.create_job(fixtures::one_way_params(2)).await.unwrap();

    store.set_status(orphan.job_id, JobStatus::Running, None).await.unwrap();
    store.set_status(leased.job_id, JobStatus::Running, None).await.unwrap();
    store
        .acquire_lease(leased.job_id, "worker-b", Duration::from_secs(60))
        .await
        .unwrap();

    let queue = InMemoryQueue::new();
    let d = dispatcher(
        store.clone(),
        Arc::new(ScriptedBackend::always(vec![])),
        Arc::new(queue.clone()),
        "worker-a",
    );

    assert_eq!(d.reconcile_once().await.unwrap(), 1);
    assert_eq!(queue.ready_len(), 1);
    let delivery = queue.receive().await.unwrap();
    assert_eq!(delivery.job_id, orphan.job_id);
    assert_ne!(delivery.job_id, pending.job_id);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_hands_job_to_next_worker() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let params = fixtures::one_way_params(30).with_max_concurrent_searches(1);
    let job = store.create_job(params.clone()).await.unwrap();

    let first_backend =
        Arc::new(priced_backend(&params, |_, _| None).with_latency(Duration::from_secs(1)));
    let first_queue = InMemoryQueue::new();
    let shutdown = ShutdownCoordinator::new();
    let first = Dispatcher::new(
        context(store.clone(), first_backend, 4, settings(2)),
        Arc::new(first_queue.clone()),
        "worker-a",
        lease_settings(),
        shutdown.clone(),
    );
    first_queue.publish(job.job_id).await.unwrap();
    let running = tokio::spawn({
        let first = first.clone();
        async move { first.run().await }
    });

    wait_for_checkpoint(&store, job.job_id, 4).await;
    shutdown.request_shutdown();
    running.await.unwrap().unwrap();

    let record = load(&store, job.job_id).await;
    assert_eq!(record.job.status, JobStatus::Running);
    assert!(record.lease.is_none());
    let handed_over = record.checkpoint.processed_index;
    assert!(handed_over >= 4 && handed_over < 30);

    let second_backend = Arc::new(priced_backend(&params, |_, _| None));
    let second_queue = InMemoryQueue::new();
    let second = dispatcher(
        store.clone(),
        second_backend.clone(),
        Arc::new(second_queue.clone()),
        "worker-b",
    );
    assert_eq!(second.reconcile_once().await.unwrap(), 1);
    let delivery = second_queue.receive().await.unwrap();
    let report = started(second.handle_delivery(delivery).await.unwrap())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(second_backend.call_count() as u64, 30 - handed_over);

    let results = store.results(job.job_id).await.unwrap();
    let indices: Vec<u64> = results.iter().map(|r| r.combination_index).collect();
    assert_eq!(indices, (0..30).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_polling_worker_drains_queued_jobs() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let queue = Arc::new(StorePollingQueue::new(store.clone(), Duration::from_millis(10)));
    let shutdown = ShutdownCoordinator::new();
    let d = Dispatcher::new(
        context(
            store.clone(),
            Arc::new(ScriptedBackend::always(vec![fixtures::offer(450.0)])),
            2,
            settings(2),
        ),
        queue,
        "worker-a",
        lease_settings(),
        shutdown.clone(),
    );
    let running = tokio::spawn({
        let d = d.clone();
        async move { d.run().await }
    });

    let mut jobs = Vec::new();
    for days in [3, 5, 4] {
        jobs.push(store.create_job(fixtures::one_way_params(days)).await.unwrap());
    }

    let status = StatusService::new(store.clone());
    for job in &jobs {
        let (status, job_id) = (&status, job.job_id);
        wait_until("job completion", || async move {
            status.get_status(job_id).await.unwrap().status == JobStatus::Completed
        })
        .await;
        let report = status.get_status(job.job_id).await.unwrap();
        assert_eq!(report.processed_combinations, report.total_combinations);
        assert_eq!(report.best_price, Some(450.0));
        assert!((report.progress - 1.0).abs() < 1e-9);
    }

    shutdown.request_shutdown();
    running.await.unwrap().unwrap();
    assert!(d.registry().is_empty());
}
