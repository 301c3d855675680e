//! Lease lifecycle and abandoned-job recovery against an in-memory store.
//!
//! Covers claim, expiry, requeue, retry exhaustion, concurrent sweeps and
//! the one-partition-per-job guarantee.

use std::sync::Arc;

use chrono::Duration;
use shepherd::{
    AbandonedJobRecovery, Clock, JobId, JobStatus, JobStore, LeaseManager, RetryPolicy,
    StoreError, TransitionOutcome, RETRY_EXHAUSTED_ERROR,
};
use shepherd_testkit::{memory_store, queued_record, t0, FaultyObjectStore, ManualClock};

struct Harness {
    store: JobStore,
    clock: Arc<ManualClock>,
    leases: LeaseManager,
    recovery: AbandonedJobRecovery,
}

impl Harness {
    fn new() -> Self {
        let store = memory_store();
        let clock = Arc::new(ManualClock::new(t0()));
        let policy = RetryPolicy::default();
        let dyn_clock = clock.clone() as Arc<dyn Clock>;
        Self {
            leases: LeaseManager::new(store.clone(), policy, dyn_clock.clone()),
            recovery: AbandonedJobRecovery::new(store.clone(), policy, dyn_clock),
            store,
            clock,
        }
    }

    async fn enqueue(&self, job_id: &str) -> JobId {
        let record = queued_record(job_id);
        self.store.create(&record).await.unwrap();
        record.job_id
    }

    async fn partitions_of(&self, job_id: &JobId) -> Vec<JobStatus> {
        self.store
            .locate(job_id)
            .await
            .unwrap()
            .into_iter()
            .map(|copy| copy.partition)
            .collect()
    }
}

#[tokio::test]
async fn test_expired_lease_is_requeued_with_attempt() {
    let h = Harness::new();
    let job_id = h.enqueue("job-a").await;

    let started = h
        .leases
        .start_processing(&job_id, "worker-a")
        .await
        .unwrap()
        .applied()
        .expect("claim applies");
    assert_eq!(started.lock_until, Some(t0() + Duration::seconds(600)));
    assert_eq!(started.lock_owner.as_deref(), Some("worker-a"));

    h.clock.advance_secs(601);
    let report = h.recovery.sweep().await.unwrap();
    assert_eq!(report.requeued, 1);

    let job = h.store.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.partition, JobStatus::Queued);
    assert_eq!(job.record.attempts, 1);
    assert!(job.record.lock_owner.is_none());
    assert!(job.record.lock_until.is_none());
}

#[tokio::test]
async fn test_lease_at_exact_expiry_is_still_live() {
    let h = Harness::new();
    let job_id = h.enqueue("job-edge").await;
    h.leases.start_processing(&job_id, "worker-a").await.unwrap();

    h.clock.advance_secs(600);
    let report = h.recovery.sweep().await.unwrap();
    assert!(report.is_empty());
    assert_eq!(h.partitions_of(&job_id).await, vec![JobStatus::Processing]);
}

#[tokio::test]
async fn test_fourth_abandonment_fails_job() {
    let h = Harness::new();
    let job_id = h.enqueue("job-b").await;

    for expected_attempts in 1..=3 {
        h.leases.start_processing(&job_id, "worker-a").await.unwrap();
        h.clock.advance_secs(601);
        let report = h.recovery.sweep().await.unwrap();
        assert_eq!(report.requeued, 1);
        let job = h.store.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.partition, JobStatus::Queued);
        assert_eq!(job.record.attempts, expected_attempts);
    }

    h.leases.start_processing(&job_id, "worker-a").await.unwrap();
    h.clock.advance_secs(601);
    let report = h.recovery.sweep().await.unwrap();
    assert_eq!(report.failed, 1);

    let job = h.store.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.partition, JobStatus::Failed);
    assert_eq!(job.record.attempts, 3);
    assert_eq!(job.record.error.as_deref(), Some(RETRY_EXHAUSTED_ERROR));
}

#[tokio::test]
async fn test_failed_job_is_left_alone_by_later_sweeps() {
    let h = Harness::new();
    let job_id = h.enqueue("job-done-failing").await;
    h.leases.start_processing(&job_id, "worker-a").await.unwrap();
    h.leases.fail(&job_id, "processor crashed").await.unwrap();
    let before = h.store.get(&job_id).await.unwrap().unwrap();

    h.clock.advance_secs(10_000);
    assert!(h.recovery.sweep().await.unwrap().is_empty());

    let after = h.store.get(&job_id).await.unwrap().unwrap();
    assert_eq!(after.record, before.record);
    assert_eq!(after.partition, JobStatus::Failed);
}

#[tokio::test]
async fn test_concurrent_sweeps_reclaim_once() {
    let h = Harness::new();
    let job_id = h.enqueue("job-c").await;
    h.leases.start_processing(&job_id, "worker-a").await.unwrap();
    h.clock.advance_secs(601);

    let other = AbandonedJobRecovery::new(
        h.store.clone(),
        RetryPolicy::default(),
        h.clock.clone() as Arc<dyn Clock>,
    );
    // Both workers list `Processing` before either one moves the job.
    let now = h.clock.now();
    let first_listing = h.store.list_by_status(JobStatus::Processing).await.unwrap();
    let second_listing = h.store.list_by_status(JobStatus::Processing).await.unwrap();
    let (first, second) = tokio::join!(
        h.recovery.sweep_listing(first_listing, now),
        other.sweep_listing(second_listing, now)
    );
    assert_eq!(first.requeued + second.requeued, 1);
    assert_eq!(first.superseded + second.superseded, 1);

    let job = h.store.reconcile(&job_id).await.unwrap().unwrap();
    assert_eq!(job.partition, JobStatus::Queued);
    assert_eq!(job.record.attempts, 1);
    assert_eq!(h.partitions_of(&job_id).await, vec![JobStatus::Queued]);
}

#[tokio::test]
async fn test_completed_job_is_never_reclaimed() {
    let h = Harness::new();
    let job_id = h.enqueue("job-d").await;
    h.leases.start_processing(&job_id, "worker-a").await.unwrap();

    h.clock.advance_secs(30);
    let outcome = h
        .leases
        .complete(&job_id, Some(serde_json::json!({ "count": 4 })))
        .await
        .unwrap();
    assert!(outcome.is_applied());

    let job = h.store.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.partition, JobStatus::Completed);
    assert_eq!(job.record.completed_at, Some(t0() + Duration::seconds(30)));

    h.clock.advance_secs(10_000);
    assert!(h.recovery.sweep().await.unwrap().is_empty());
    assert_eq!(h.partitions_of(&job_id).await, vec![JobStatus::Completed]);

    let marker = h
        .store
        .completion(&job.record.work_key)
        .await
        .unwrap()
        .expect("completion marker written");
    assert_eq!(marker.job_id, job_id);
}

#[tokio::test]
async fn test_recovery_is_idempotent() {
    let h = Harness::new();
    let job_id = h.enqueue("job-idem").await;
    h.leases.start_processing(&job_id, "worker-a").await.unwrap();
    h.clock.advance_secs(601);

    let first = h.recovery.sweep().await.unwrap();
    let second = h.recovery.sweep().await.unwrap();
    assert_eq!(first.requeued, 1);
    assert!(second.is_empty());
    assert_eq!(h.store.get(&job_id).await.unwrap().unwrap().record.attempts, 1);
}

#[tokio::test]
async fn test_sweep_reclaims_only_expired_leases() {
    let h = Harness::new();
    for id in ["job-s1", "job-s2", "job-s3"] {
        let job_id = h.enqueue(id).await;
        h.leases.start_processing(&job_id, "worker-a").await.unwrap();
    }
    let live = h.enqueue("job-live").await;
    h.clock.advance_secs(601);
    h.leases.start_processing(&live, "worker-b").await.unwrap();

    assert_eq!(h.recovery.sweep().await.unwrap().reclaimed(), 3);
    assert_eq!(h.recovery.sweep().await.unwrap().reclaimed(), 0);
    assert_eq!(h.partitions_of(&live).await, vec![JobStatus::Processing]);
}

#[tokio::test]
async fn test_live_lease_blocks_other_workers() {
    let h = Harness::new();
    let job_id = h.enqueue("job-owned").await;
    h.leases.start_processing(&job_id, "worker-a").await.unwrap();

    let outcome = h.leases.start_processing(&job_id, "worker-b").await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Superseded);

    let renewal = h.leases.renew(&job_id, "worker-b", None).await.unwrap();
    assert_eq!(renewal, TransitionOutcome::Superseded);
}

#[tokio::test]
async fn test_renewal_keeps_job_out_of_recovery() {
    let h = Harness::new();
    let job_id = h.enqueue("job-renew").await;
    h.leases.start_processing(&job_id, "worker-a").await.unwrap();

    h.clock.advance_secs(500);
    assert!(h.leases.renew(&job_id, "worker-a", None).await.unwrap().is_applied());
    h.clock.advance_secs(500);
    assert!(h.recovery.sweep().await.unwrap().is_empty());

    let job = h.store.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.record.lock_until, Some(t0() + Duration::seconds(1100)));
}

#[tokio::test]
async fn test_job_lives_in_one_partition_through_lifecycle() {
    let h = Harness::new();
    let job_id = h.enqueue("job-walk").await;
    assert_eq!(h.partitions_of(&job_id).await, vec![JobStatus::Queued]);

    h.leases.start_processing(&job_id, "worker-a").await.unwrap();
    assert_eq!(h.partitions_of(&job_id).await, vec![JobStatus::Processing]);

    h.clock.advance_secs(601);
    h.recovery.sweep().await.unwrap();
    assert_eq!(h.partitions_of(&job_id).await, vec![JobStatus::Queued]);

    h.leases.start_processing(&job_id, "worker-b").await.unwrap();
    h.leases.complete(&job_id, None).await.unwrap();
    assert_eq!(h.partitions_of(&job_id).await, vec![JobStatus::Completed]);
}

#[tokio::test]
async fn test_interrupted_move_is_rolled_forward_by_sweep() {
    let h = Harness::new();
    let job_id = h.enqueue("job-torn").await;
    let claimed = h
        .leases
        .start_processing(&job_id, "worker-a")
        .await
        .unwrap()
        .applied()
        .unwrap();

    // A mover that fenced the source and died before writing the target.
    let mut requeued = claimed.clone();
    requeued.status = JobStatus::Queued;
    requeued.lock_owner = None;
    requeued.lock_until = None;
    requeued.updated_at = t0() + Duration::seconds(1);
    h.store.save(&requeued, JobStatus::Processing).await.unwrap();

    let report = h.recovery.sweep().await.unwrap();
    assert_eq!(report.rolled_forward, 1);
    assert_eq!(h.partitions_of(&job_id).await, vec![JobStatus::Queued]);
}

#[tokio::test]
async fn test_late_roll_forward_leaves_new_owner_alone() {
    let h = Harness::new();
    let job_id = h.enqueue("job-late").await;
    let claimed = h
        .leases
        .start_processing(&job_id, "worker-a")
        .await
        .unwrap()
        .applied()
        .unwrap();
    h.clock.advance_secs(601);

    // A requeue fenced the `processing` copy; another worker lists it.
    let mut requeued = claimed.clone();
    requeued.status = JobStatus::Queued;
    requeued.lock_owner = None;
    requeued.lock_until = None;
    requeued.attempts = 1;
    requeued.updated_at = h.clock.now();
    h.store.save(&requeued, JobStatus::Processing).await.unwrap();
    let listed = h
        .store
        .get_by_status(&job_id, JobStatus::Processing)
        .await
        .unwrap()
        .unwrap();
    assert!(!listed.is_settled());

    // The requeue completes and a third worker claims the job.
    h.store.save(&requeued, JobStatus::Queued).await.unwrap();
    h.store.delete(&job_id, JobStatus::Processing).await.unwrap();
    assert!(h
        .leases
        .start_processing(&job_id, "worker-c")
        .await
        .unwrap()
        .is_applied());

    let err = h.store.roll_forward(&listed).await.unwrap_err();
    assert!(err.is_conflict());
    let report = h.recovery.sweep_listing(vec![listed], h.clock.now()).await;
    assert_eq!(report.superseded, 1);
    assert_eq!(report.rolled_forward, 0);

    assert_eq!(h.partitions_of(&job_id).await, vec![JobStatus::Processing]);
    assert!(h.leases.renew(&job_id, "worker-c", None).await.unwrap().is_applied());
    assert!(h.leases.complete(&job_id, None).await.unwrap().is_applied());
    assert_eq!(h.partitions_of(&job_id).await, vec![JobStatus::Completed]);
}

#[tokio::test]
async fn test_store_write_failure_is_surfaced() {
    let objects = Arc::new(FaultyObjectStore::new());
    let store = JobStore::new(objects.clone());
    let clock = Arc::new(ManualClock::new(t0())) as Arc<dyn Clock>;
    let leases = LeaseManager::new(store.clone(), RetryPolicy::default(), clock);
    let record = queued_record("job-broken");
    store.create(&record).await.unwrap();
    leases.start_processing(&record.job_id, "worker-a").await.unwrap();

    objects.fail_puts(true);
    let err = leases.complete(&record.job_id, None).await.unwrap_err();
    assert!(matches!(err, StoreError::Backend { .. }));
    let err = store.create(&queued_record("job-other")).await.unwrap_err();
    assert!(matches!(err, StoreError::Backend { .. }));

    objects.fail_puts(false);
    let job = store.get(&record.job_id).await.unwrap().unwrap();
    assert_eq!(job.partition, JobStatus::Processing);
    assert_eq!(job.record.lock_owner.as_deref(), Some("worker-a"));
    assert!(store.completion(&job.record.work_key).await.unwrap().is_none());
}
