//! Integration tests for the file-backed job store

use chrono::{NaiveDate, Utc};
use farescan_store::{
    Checkpoint, DatePair, FileJobStore, FlightResult, JobStatus, JobStore, JsonSerializer,
    LeaseOutcome, PriceIndicator, SearchParameters, StoreError,
};
use std::time::Duration;
use tempfile::TempDir;

fn params() -> SearchParameters {
    SearchParameters::new(
        ["VNO", "RIX", "KUN"],
        ["BKK", "SIN"],
        [DatePair::round_trip(
            NaiveDate::from_ymd_opt(2025, 11, 3).unwrap(),
            NaiveDate::from_ymd_opt(2025, 11, 17).unwrap(),
        )],
    )
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();

    let job_id = {
        let store = FileJobStore::open(dir.path()).await.unwrap();
        let job = store.create_job(params()).await.unwrap();
        store.set_status(job.job_id, JobStatus::Running, None).await.unwrap();

        let checkpoint = Checkpoint {
            processed_index: 3,
            found_flights: 2,
            best_price: Some(611.0),
            ..Checkpoint::initial()
        };
        assert_eq!(store.save_checkpoint(job.job_id, &checkpoint, 0).await.unwrap(), 1);
        job.job_id
    };

    let store = FileJobStore::open(dir.path()).await.unwrap();
    let record = store.load(job_id).await.unwrap();
    assert_eq!(record.job.status, JobStatus::Running);
    assert_eq!(record.job.total_combinations, 6);
    assert_eq!(record.job.processed_combinations, 3);
    assert_eq!(record.checkpoint.version, 1);
    assert_eq!(record.checkpoint.best_price, Some(611.0));
}

#[tokio::test]
async fn test_version_conflict_leaves_checkpoint_untouched() {
    let dir = TempDir::new().unwrap();
    let store = FileJobStore::open(dir.path()).await.unwrap();
    let job = store.create_job(params()).await.unwrap();

    let mut checkpoint = Checkpoint::initial();
    checkpoint.processed_index = 2;
    store.save_checkpoint(job.job_id, &checkpoint, 0).await.unwrap();

    checkpoint.processed_index = 4;
    let err = store.save_checkpoint(job.job_id, &checkpoint, 0).await.unwrap_err();
    assert!(matches!(err, StoreError::VersionConflict { actual: 1, .. }));

    let record = store.load(job.job_id).await.unwrap();
    assert_eq!(record.checkpoint.processed_index, 2);
}

#[tokio::test]
async fn test_results_are_deduplicated_across_reopen() {
    let dir = TempDir::new().unwrap();
    let store = FileJobStore::open(dir.path()).await.unwrap();
    let job = store.create_job(params()).await.unwrap();

    let combos: Vec<_> = job.parameters.combinations().take(2).collect();
    for combo in &combos {
        let result = FlightResult::for_combination(
            job.job_id,
            combo,
            640.0,
            "Finnair",
            1,
            "15h 40m",
            PriceIndicator::Typical,
        );
        assert!(store.append_result(result).await.unwrap());
    }

    let reopened = FileJobStore::open(dir.path()).await.unwrap();
    let duplicate = FlightResult::for_combination(
        job.job_id,
        &combos[0],
        500.0,
        "Qatar",
        1,
        "14h 00m",
        PriceIndicator::Low,
    );
    assert!(!reopened.append_result(duplicate).await.unwrap());

    let results = reopened.results(job.job_id).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].combination_index, 0);
    assert_eq!(results[0].airline, "Finnair");
}

#[tokio::test]
async fn test_torn_result_line_is_skipped() {
    let dir = TempDir::new().unwrap();
    let store = FileJobStore::open(dir.path()).await.unwrap();
    let job = store.create_job(params()).await.unwrap();
    let combo = job.parameters.combinations().next().unwrap();

    let result =
        FlightResult::for_combination(job.job_id, &combo, 600.0, "LOT", 0, "12h", PriceIndicator::Low);
    store.append_result(result).await.unwrap();

    let path = dir.path().join(job.job_id.to_string()).join("results.jsonl");
    let mut content = std::fs::read_to_string(&path).unwrap();
    content.push_str("{\"job_id\":\"");
    std::fs::write(&path, content).unwrap();

    let reopened = FileJobStore::open(dir.path()).await.unwrap();
    assert_eq!(reopened.results(job.job_id).await.unwrap().len(), 1);

    // The next append must not be glued onto the partial line.
    let next = job.parameters.combinations().nth(1).unwrap();
    let result =
        FlightResult::for_combination(job.job_id, &next, 580.0, "LOT", 0, "12h", PriceIndicator::Low);
    assert!(reopened.append_result(result).await.unwrap());

    let again = FileJobStore::open(dir.path()).await.unwrap();
    let indices: Vec<u64> = again
        .results(job.job_id)
        .await
        .unwrap()
        .iter()
        .map(|r| r.combination_index)
        .collect();
    assert_eq!(indices, vec![0, 1]);
    assert!(std::fs::read_to_string(&path).unwrap().ends_with('\n'));
}

#[tokio::test]
async fn test_finished_job_keeps_its_checkpoint() {
    let dir = TempDir::new().unwrap();
    let store = FileJobStore::open(dir.path()).await.unwrap();
    let job = store.create_job(params()).await.unwrap();
    store.set_status(job.job_id, JobStatus::Running, None).await.unwrap();

    let mut checkpoint = Checkpoint::initial();
    checkpoint.processed_index = 2;
    let version = store.save_checkpoint(job.job_id, &checkpoint, 0).await.unwrap();
    store.set_status(job.job_id, JobStatus::Cancelled, None).await.unwrap();

    checkpoint.processed_index = 4;
    let err = store
        .save_checkpoint(job.job_id, &checkpoint, version)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::JobFinished {
            status: JobStatus::Cancelled,
            ..
        }
    ));
    assert_eq!(store.load(job.job_id).await.unwrap().checkpoint.processed_index, 2);
}

#[tokio::test]
async fn test_leases_and_orphans() {
    let dir = TempDir::new().unwrap();
    let store = FileJobStore::with_serializer(dir.path(), JsonSerializer)
        .await
        .unwrap();
    let job = store.create_job(params()).await.unwrap();
    let ttl = Duration::from_secs(60);

    assert_eq!(store.pending_jobs().await.unwrap(), vec![job.job_id]);
    store.set_status(job.job_id, JobStatus::Running, None).await.unwrap();
    assert!(store.pending_jobs().await.unwrap().is_empty());
    assert_eq!(store.orphaned_jobs(Utc::now()).await.unwrap(), vec![job.job_id]);

    assert!(store.acquire_lease(job.job_id, "a", ttl).await.unwrap().is_acquired());
    assert!(matches!(
        store.acquire_lease(job.job_id, "b", ttl).await.unwrap(),
        LeaseOutcome::Denied { .. }
    ));
    assert!(store.orphaned_jobs(Utc::now()).await.unwrap().is_empty());

    store.renew_lease(job.job_id, "a", ttl).await.unwrap();
    assert!(store.renew_lease(job.job_id, "b", ttl).await.is_err());

    store.release_lease(job.job_id, "a").await.unwrap();
    assert!(store.load(job.job_id).await.unwrap().lease.is_none());
    assert_eq!(store.orphaned_jobs(Utc::now()).await.unwrap(), vec![job.job_id]);
}

#[tokio::test]
async fn test_invalid_transition_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = FileJobStore::open(dir.path()).await.unwrap();
    let job = store.create_job(params()).await.unwrap();

    store.set_status(job.job_id, JobStatus::Cancelled, None).await.unwrap();
    let err = store
        .set_status(job.job_id, JobStatus::Running, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }));
    // Same status again is a no-op
    store.set_status(job.job_id, JobStatus::Cancelled, None).await.unwrap();
}
