use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::job::JobStatus;
use crate::lease::{process_expired_lease, ReclaimDecision, RetryPolicy, RETRY_EXHAUSTED_ERROR};
use crate::store::{JobStore, StoreError, StoredJob};
use crate::telemetry;

/// Tally of one recovery sweep.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SweepReport {
    /// Abandoned jobs returned to `Queued`.
    pub requeued: u64,
    /// Abandoned jobs moved to `Failed` after exhausting their retries.
    pub failed: u64,
    /// Abandoned jobs another worker reclaimed first.
    pub superseded: u64,
    /// Interrupted moves found in `Processing` and finished.
    pub rolled_forward: u64,
}

impl SweepReport {
    /// Jobs this sweep reclaimed itself.
    pub fn reclaimed(&self) -> u64 {
        self.requeued + self.failed
    }

    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

/// Sweeps `Processing` for jobs whose lease expired and requeues or fails
/// them according to the [`RetryPolicy`].
///
/// Every worker runs the sweep independently. Each reclaim is a move
/// conditional on the version read during the sweep, so concurrent sweeps
/// apply at most one reclaim per abandonment.
#[derive(Clone, Debug)]
pub struct AbandonedJobRecovery {
    store: JobStore,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl AbandonedJobRecovery {
    pub fn new(store: JobStore, policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policy,
            clock,
        }
    }

    /// Sweep using the injected clock's current time.
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        self.sweep_at(self.clock.now()).await
    }

    /// Sweep with an explicit observation time.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let candidates = self.store.list_by_status(JobStatus::Processing).await?;
        Ok(self.sweep_listing(candidates, now).await)
    }

    /// Reclaims from a listing of `Processing` taken earlier. Entries that
    /// changed since the listing are counted as superseded.
    pub async fn sweep_listing(&self, candidates: Vec<StoredJob>, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for job in candidates {
            if !job.is_settled() {
                match self.store.roll_forward(&job).await {
                    Ok(_) => {
                        report.rolled_forward += 1;
                        telemetry::record_lease_reclaimed(job.job_id().as_str(), "rolled_forward", job.record.attempts);
                    }
                    Err(StoreError::Conflict { .. }) => {
                        report.superseded += 1;
                        telemetry::record_lease_reclaimed(job.job_id().as_str(), "superseded", job.record.attempts);
                    }
                    Err(err) => warn!(job_id = %job.job_id(), error = %err, "failed to roll forward job"),
                }
                continue;
            }
            if !job.record.is_lease_expired(now) {
                continue;
            }

            match self.reclaim(&job, now).await {
                Ok(Some(decision)) => match decision {
                    ReclaimDecision::Requeue { .. } => report.requeued += 1,
                    ReclaimDecision::Fail => report.failed += 1,
                },
                Ok(None) => report.superseded += 1,
                Err(err) => warn!(job_id = %job.job_id(), error = %err, "failed to reclaim abandoned job"),
            }
        }

        if !report.is_empty() {
            debug!(?report, "recovery sweep finished");
        }
        report
    }

    /// Returns `None` when another worker changed the job first.
    async fn reclaim(
        &self,
        job: &StoredJob,
        now: DateTime<Utc>,
    ) -> Result<Option<ReclaimDecision>, StoreError> {
        let decision = process_expired_lease(job.record.attempts, &self.policy);

        let mut updated = job.record.clone();
        updated.clear_lease();
        updated.updated_at = now.max(job.record.updated_at);
        let (to, outcome) = match decision {
            ReclaimDecision::Requeue { attempts } => {
                updated.status = JobStatus::Queued;
                updated.attempts = attempts;
                (JobStatus::Queued, "requeued")
            }
            ReclaimDecision::Fail => {
                updated.status = JobStatus::Failed;
                updated.error = Some(RETRY_EXHAUSTED_ERROR.to_string());
                (JobStatus::Failed, "failed")
            }
        };
        let attempts = updated.attempts;

        match self.store.move_job(job, JobStatus::Processing, to, updated).await {
            Ok(_) => {
                telemetry::record_lease_reclaimed(job.job_id().as_str(), outcome, attempts);
                Ok(Some(decision))
            }
            Err(StoreError::Conflict { .. }) => {
                telemetry::record_lease_reclaimed(job.job_id().as_str(), "superseded", job.record.attempts);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use object_store::memory::InMemory;

    use crate::clock::SystemClock;
    use crate::job::{JobId, JobPayload, JobRecord, WorkKey};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 15, 12, 0, 0).unwrap()
    }

    fn leased(id: &str, attempts: u32, lock_until: Option<DateTime<Utc>>) -> JobRecord {
        let mut job = JobRecord::new(
            JobId::from(id),
            WorkKey::new(id),
            JobPayload {
                work_ref: id.into(),
                task_param: "hustle".into(),
            },
            t0(),
        );
        job.status = JobStatus::Processing;
        job.attempts = attempts;
        job.lock_owner = Some("w1".into());
        job.lock_until = lock_until;
        job
    }

    fn recovery() -> AbandonedJobRecovery {
        let store = JobStore::new(Arc::new(InMemory::new()));
        AbandonedJobRecovery::new(store, RetryPolicy::default(), Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn test_live_lease_is_left_alone() {
        let recovery = recovery();
        let until = t0() + Duration::seconds(600);
        recovery
            .store
            .save(&leased("j1", 0, Some(until)), JobStatus::Processing)
            .await
            .unwrap();

        let report = recovery.sweep_at(until).await.unwrap();
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_missing_lease_counts_as_abandoned() {
        let recovery = recovery();
        recovery
            .store
            .save(&leased("j1", 0, None), JobStatus::Processing)
            .await
            .unwrap();

        let report = recovery.sweep_at(t0()).await.unwrap();
        assert_eq!(report.requeued, 1);

        let job = recovery.store.get(&JobId::from("j1")).await.unwrap().unwrap();
        assert_eq!(job.partition, JobStatus::Queued);
        assert_eq!(job.record.attempts, 1);
        assert!(job.record.lock_owner.is_none());
    }

    #[tokio::test]
    async fn test_exhausted_job_is_failed() {
        let recovery = recovery();
        recovery
            .store
            .save(&leased("j1", 3, Some(t0())), JobStatus::Processing)
            .await
            .unwrap();

        let report = recovery.sweep_at(t0() + Duration::seconds(1)).await.unwrap();
        assert_eq!(report.failed, 1);

        let job = recovery.store.get(&JobId::from("j1")).await.unwrap().unwrap();
        assert_eq!(job.partition, JobStatus::Failed);
        assert_eq!(job.record.attempts, 3);
        assert_eq!(job.record.error.as_deref(), Some(RETRY_EXHAUSTED_ERROR));
    }

    #[tokio::test]
    async fn test_stale_read_is_superseded() {
        let recovery = recovery();
        let stored = recovery
            .store
            .save(&leased("j1", 0, Some(t0())), JobStatus::Processing)
            .await
            .unwrap();
        let later = t0() + Duration::seconds(1);

        assert_eq!(recovery.reclaim(&stored, later).await.unwrap(), Some(ReclaimDecision::Requeue { attempts: 1 }));
        assert_eq!(recovery.reclaim(&stored, later).await.unwrap(), None);

        let job = recovery.store.get(&JobId::from("j1")).await.unwrap().unwrap();
        assert_eq!(job.record.attempts, 1);
    }

    #[tokio::test]
    async fn test_listing_taken_by_two_sweeps_reclaims_once() {
        let recovery = recovery();
        recovery
            .store
            .save(&leased("a", 0, Some(t0())), JobStatus::Processing)
            .await
            .unwrap();
        recovery
            .store
            .save(&leased("b", 5, Some(t0())), JobStatus::Processing)
            .await
            .unwrap();
        let listing = recovery.store.list_by_status(JobStatus::Processing).await.unwrap();
        let later = t0() + Duration::seconds(1);

        let first = recovery.sweep_listing(listing.clone(), later).await;
        assert_eq!(first.reclaimed(), 2);
        let second = recovery.sweep_listing(listing, later).await;
        assert_eq!(second.reclaimed(), 0);
        assert_eq!(second.superseded, 2);
    }
}
