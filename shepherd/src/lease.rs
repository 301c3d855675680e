use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::job::{JobId, JobRecord, JobStatus, Progress};
use crate::store::{CompletionMarker, JobStore, StoreError, StoredJob};

/// Error recorded on jobs that ran out of retries.
pub const RETRY_EXHAUSTED_ERROR: &str = "exceeded maximum retry attempts";

/// Bounds on lease ownership and abandoned-job retries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Number of requeues allowed before an abandoned job is failed.
    pub max_attempts: u32,
    /// How long a claim stays valid without renewal.
    pub lease_duration: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            lease_duration: Duration::seconds(600),
        }
    }
}

impl RetryPolicy {
    /// Lease duration as a std duration, for queue visibility timeouts.
    pub fn lease_duration_std(&self) -> std::time::Duration {
        self.lease_duration.to_std().unwrap_or_default()
    }
}

/// Returns true once a job has used up its requeues.
pub fn should_fail(attempts: u32, max_attempts: u32) -> bool {
    attempts >= max_attempts
}

/// What recovery does with an abandoned job.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReclaimDecision {
    /// Return the job to `Queued` with the given attempt count.
    Requeue { attempts: u32 },
    /// Move the job to `Failed`.
    Fail,
}

/// Decides the fate of an abandoned job from its current attempt count.
pub fn process_expired_lease(current_attempts: u32, policy: &RetryPolicy) -> ReclaimDecision {
    if should_fail(current_attempts, policy.max_attempts) {
        ReclaimDecision::Fail
    } else {
        ReclaimDecision::Requeue {
            attempts: current_attempts.saturating_add(1),
        }
    }
}

/// Result of a lease transition.
///
/// `NotFound` and `Superseded` are expected outcomes when recovery or
/// another worker got there first; callers log them and move on.
#[derive(Clone, Debug, PartialEq)]
pub enum TransitionOutcome {
    Applied(JobRecord),
    /// The job is not in the partition the transition starts from.
    NotFound,
    /// Another writer changed the job first, or the caller lost its lease.
    Superseded,
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }

    pub fn applied(self) -> Option<JobRecord> {
        match self {
            TransitionOutcome::Applied(record) => Some(record),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TransitionOutcome::Applied(_) => "applied",
            TransitionOutcome::NotFound => "not_found",
            TransitionOutcome::Superseded => "superseded",
        }
    }
}

/// Lease-based job state transitions on top of a [`JobStore`].
///
/// Every transition is a conditional move against the version that was
/// read, so two workers racing on one job cannot both apply.
#[derive(Clone, Debug)]
pub struct LeaseManager {
    store: JobStore,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl LeaseManager {
    pub fn new(store: JobStore, policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policy,
            clock,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Claims a job for `worker_id`, moving it `Queued -> Processing` or
    /// re-entering `Processing`.
    ///
    /// A `Processing` job held by another worker under a live lease is
    /// reported as `Superseded`.
    pub async fn start_processing(
        &self,
        job_id: &JobId,
        worker_id: &str,
    ) -> Result<TransitionOutcome, StoreError> {
        let Some(current) = self.current(job_id).await? else {
            return Ok(TransitionOutcome::NotFound);
        };
        let now = self.clock.now();
        match current.partition {
            JobStatus::Queued => {}
            JobStatus::Processing => {
                if !current.record.is_owned_by(worker_id) && !current.record.is_lease_expired(now) {
                    return Ok(TransitionOutcome::Superseded);
                }
            }
            _ => return Ok(TransitionOutcome::NotFound),
        }

        let mut updated = current.record.clone();
        updated.status = JobStatus::Processing;
        updated.lock_owner = Some(worker_id.to_string());
        updated.lock_until = Some(now + self.policy.lease_duration);
        updated.updated_at = now;

        self.transition(&current, JobStatus::Processing, updated).await
    }

    /// Extends the caller's lease and records progress when given.
    pub async fn renew(
        &self,
        job_id: &JobId,
        worker_id: &str,
        progress: Option<Progress>,
    ) -> Result<TransitionOutcome, StoreError> {
        let Some(current) = self.current(job_id).await? else {
            return Ok(TransitionOutcome::NotFound);
        };
        if current.partition != JobStatus::Processing {
            return Ok(TransitionOutcome::NotFound);
        }
        if !current.record.is_owned_by(worker_id) {
            debug!(job_id = %job_id, worker_id, "lease renewal by non-owner rejected");
            return Ok(TransitionOutcome::Superseded);
        }

        let now = self.clock.now();
        let mut updated = current.record.clone();
        updated.lock_until = Some(now + self.policy.lease_duration);
        updated.updated_at = now;
        if progress.is_some() {
            updated.progress = progress;
        }

        self.transition(&current, JobStatus::Processing, updated).await
    }

    /// Moves `Processing -> Completed`, stamps `completed_at` and records
    /// the completion marker for the job's work key.
    pub async fn complete(
        &self,
        job_id: &JobId,
        result: Option<serde_json::Value>,
    ) -> Result<TransitionOutcome, StoreError> {
        let Some(current) = self.current(job_id).await? else {
            return Ok(TransitionOutcome::NotFound);
        };
        if current.partition != JobStatus::Processing {
            return Ok(TransitionOutcome::NotFound);
        }

        let now = self.clock.now();
        let mut updated = current.record.clone();
        updated.status = JobStatus::Completed;
        updated.clear_lease();
        updated.completed_at = Some(now);
        updated.updated_at = now;
        updated.result = result;

        let outcome = self.transition(&current, JobStatus::Completed, updated).await?;
        if let TransitionOutcome::Applied(record) = &outcome {
            let marker = CompletionMarker {
                work_key: record.work_key.clone(),
                job_id: record.job_id.clone(),
                completed_at: now,
            };
            if let Err(err) = self.store.mark_completed(&marker).await {
                warn!(job_id = %job_id, error = %err, "failed to write completion marker");
            }
        }
        Ok(outcome)
    }

    /// Moves a `Queued` or `Processing` job to `Failed`, counting the
    /// failure as an attempt.
    pub async fn fail(&self, job_id: &JobId, error: &str) -> Result<TransitionOutcome, StoreError> {
        let Some(current) = self.current(job_id).await? else {
            return Ok(TransitionOutcome::NotFound);
        };
        if !matches!(current.partition, JobStatus::Queued | JobStatus::Processing) {
            return Ok(TransitionOutcome::NotFound);
        }

        let now = self.clock.now();
        let mut updated = current.record.clone();
        updated.status = JobStatus::Failed;
        updated.clear_lease();
        updated.attempts = updated.attempts.saturating_add(1);
        updated.error = Some(error.to_string());
        updated.updated_at = now;

        self.transition(&current, JobStatus::Failed, updated).await
    }

    /// Newest copy of a job, with any interrupted move finished first.
    async fn current(&self, job_id: &JobId) -> Result<Option<StoredJob>, StoreError> {
        match self.store.get(job_id).await? {
            Some(found) if !found.is_settled() => match self.store.roll_forward(&found).await {
                Ok(settled) => Ok(Some(settled)),
                // Finished or moved on by another writer since the read.
                Err(StoreError::Conflict { .. }) => self.store.get(job_id).await,
                Err(err) => Err(err),
            },
            found => Ok(found),
        }
    }

    async fn transition(
        &self,
        current: &StoredJob,
        to: JobStatus,
        updated: JobRecord,
    ) -> Result<TransitionOutcome, StoreError> {
        match self
            .store
            .move_job(current, current.partition, to, updated)
            .await
        {
            Ok(stored) => Ok(TransitionOutcome::Applied(stored.record)),
            Err(StoreError::Conflict { .. }) => {
                debug!(job_id = %current.job_id(), from = %current.partition, %to, "transition lost race");
                Ok(TransitionOutcome::Superseded)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use object_store::memory::InMemory;
    use parking_lot::Mutex;

    use crate::job::{JobPayload, WorkKey};

    #[derive(Debug)]
    struct FixedClock(Mutex<DateTime<Utc>>);

    impl FixedClock {
        fn advance(&self, by: Duration) {
            let mut now = self.0.lock();
            *now = *now + by;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock()
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 15, 12, 0, 0).unwrap()
    }

    async fn setup() -> (LeaseManager, Arc<FixedClock>, JobId) {
        let clock = Arc::new(FixedClock(Mutex::new(t0())));
        let store = JobStore::new(Arc::new(InMemory::new()));
        let job_id = JobId::from("j1");
        let record = JobRecord::new(
            job_id.clone(),
            WorkKey::new("a1Ih5GGtR8Q"),
            JobPayload {
                work_ref: "https://youtu.be/a1Ih5GGtR8Q".into(),
                task_param: "hustle".into(),
            },
            t0(),
        );
        store.create(&record).await.unwrap();
        let leases = LeaseManager::new(store, RetryPolicy::default(), clock.clone());
        (leases, clock, job_id)
    }

    #[test]
    fn test_should_fail() {
        assert!(!should_fail(0, 3));
        assert!(!should_fail(2, 3));
        assert!(should_fail(3, 3));
        assert!(should_fail(4, 3));
    }

    #[test]
    fn test_process_expired_lease_requeues_until_budget_spent() {
        let policy = RetryPolicy::default();
        assert_eq!(
            process_expired_lease(0, &policy),
            ReclaimDecision::Requeue { attempts: 1 }
        );
        assert_eq!(
            process_expired_lease(2, &policy),
            ReclaimDecision::Requeue { attempts: 3 }
        );
        assert_eq!(process_expired_lease(3, &policy), ReclaimDecision::Fail);
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.lease_duration_std(), std::time::Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_start_processing_sets_lease() {
        let (leases, _clock, job_id) = setup().await;

        let record = leases
            .start_processing(&job_id, "w1")
            .await
            .unwrap()
            .applied()
            .unwrap();
        assert_eq!(record.status, JobStatus::Processing);
        assert_eq!(record.lock_owner.as_deref(), Some("w1"));
        assert_eq!(record.lock_until, Some(t0() + Duration::seconds(600)));
    }

    #[tokio::test]
    async fn test_start_processing_respects_live_lease() {
        let (leases, clock, job_id) = setup().await;
        leases.start_processing(&job_id, "w1").await.unwrap();

        let outcome = leases.start_processing(&job_id, "w2").await.unwrap();
        assert_eq!(outcome, TransitionOutcome::Superseded);

        clock.advance(Duration::seconds(601));
        let outcome = leases.start_processing(&job_id, "w2").await.unwrap();
        assert_eq!(outcome.applied().unwrap().lock_owner.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_renew_extends_and_records_progress() {
        let (leases, clock, job_id) = setup().await;
        leases.start_processing(&job_id, "w1").await.unwrap();

        clock.advance(Duration::seconds(120));
        let progress = Progress {
            total_units: 10,
            completed_units: 4,
        };
        let record = leases
            .renew(&job_id, "w1", Some(progress))
            .await
            .unwrap()
            .applied()
            .unwrap();
        assert_eq!(record.lock_until, Some(t0() + Duration::seconds(720)));
        assert_eq!(record.progress, Some(progress));
        assert_eq!(record.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_renew_by_other_worker_is_superseded() {
        let (leases, _clock, job_id) = setup().await;
        leases.start_processing(&job_id, "w1").await.unwrap();

        let outcome = leases.renew(&job_id, "w2", None).await.unwrap();
        assert_eq!(outcome, TransitionOutcome::Superseded);
    }

    #[tokio::test]
    async fn test_complete_writes_marker() {
        let (leases, _clock, job_id) = setup().await;
        leases.start_processing(&job_id, "w1").await.unwrap();

        let record = leases
            .complete(&job_id, Some(serde_json::json!({ "count": 7 })))
            .await
            .unwrap()
            .applied()
            .unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert!(record.lock_owner.is_none());
        assert_eq!(record.completed_at, Some(t0()));

        let marker = leases
            .store()
            .completion(&WorkKey::new("a1Ih5GGtR8Q"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(marker.job_id, job_id);
    }

    #[tokio::test]
    async fn test_complete_requires_processing() {
        let (leases, _clock, job_id) = setup().await;
        let outcome = leases.complete(&job_id, None).await.unwrap();
        assert_eq!(outcome, TransitionOutcome::NotFound);

        let missing = leases.complete(&JobId::from("nope"), None).await.unwrap();
        assert_eq!(missing, TransitionOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_fail_counts_attempt() {
        let (leases, _clock, job_id) = setup().await;
        leases.start_processing(&job_id, "w1").await.unwrap();

        let record = leases
            .fail(&job_id, "transcription crashed")
            .await
            .unwrap()
            .applied()
            .unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.error.as_deref(), Some("transcription crashed"));

        let again = leases.fail(&job_id, "again").await.unwrap();
        assert_eq!(again, TransitionOutcome::NotFound);
    }
}
