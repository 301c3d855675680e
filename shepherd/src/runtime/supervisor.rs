use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, error, info, warn, Instrument};

use crate::job::{validate_work_ref, JobId, JobRecord, JobStatus, MessageBody, WorkKey};
use crate::lease::TransitionOutcome;
use crate::processor::{LeaseProgress, Processor};
use crate::queue::{ReceivedMessage, WorkQueue};
use crate::recovery::SweepReport;
use crate::store::{CompletionMarker, StoreError};
use crate::telemetry;

use super::builder::WorkerContext;
use super::heartbeat::{touch_health_file, HeartbeatStatus};
use super::shutdown::ShutdownToken;

/// Terminal result of running one claimed job.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobOutcome {
    Completed,
    Failed,
    /// The terminal transition did not apply; recovery or another worker
    /// owns the job now.
    Lost,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Failed => "failed",
            JobOutcome::Lost => "lost",
        }
    }
}

/// How a received message was handled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageDisposition {
    /// A job was created for the message and run.
    Processed(JobOutcome),
    /// Body is not a usable work item.
    Invalid,
    /// The work key already has a completion marker.
    AlreadyCompleted,
    /// A job for this message already exists; the lease path owns it.
    Redelivered,
    /// The new job was claimed by another worker before this one.
    ClaimedElsewhere,
    /// A store failure left the outcome unknown. The message is left for
    /// redelivery.
    Deferred,
}

impl MessageDisposition {
    /// Whether the message is acknowledged.
    pub fn acknowledges(&self) -> bool {
        !matches!(self, MessageDisposition::Deferred)
    }

    pub fn label(&self) -> &'static str {
        match self {
            MessageDisposition::Processed(JobOutcome::Completed) => "completed",
            MessageDisposition::Processed(JobOutcome::Failed) => "failed",
            MessageDisposition::Processed(JobOutcome::Lost) => "lost",
            MessageDisposition::Invalid => "invalid",
            MessageDisposition::AlreadyCompleted => "already_completed",
            MessageDisposition::Redelivered => "redelivered",
            MessageDisposition::ClaimedElsewhere => "claimed_elsewhere",
            MessageDisposition::Deferred => "deferred",
        }
    }
}

/// What one drain pass did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DrainReport {
    /// Requeued jobs claimed from the store and run.
    pub reclaimed_runs: Vec<(JobId, JobOutcome)>,
    /// Messages received, in order, with their disposition.
    pub messages: Vec<(String, MessageDisposition)>,
    /// Deliveries acknowledged.
    pub acknowledged: usize,
    /// Stopped early because shutdown was requested.
    pub cancelled: bool,
}

impl DrainReport {
    /// Items counted against the batch size.
    pub fn handled(&self) -> usize {
        self.reclaimed_runs.len() + self.messages.len()
    }
}

/// What one loop cycle did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CycleReport {
    pub heartbeat_published: bool,
    pub sweep: Option<SweepReport>,
    pub drain: Option<DrainReport>,
}

/// Single control loop of a worker process.
///
/// Each cycle publishes a heartbeat, sweeps for abandoned jobs, drains up
/// to `batch_size` items and sleeps for the poll interval. The shutdown
/// token is checked before draining, between items and during the sleep;
/// a processor call already in flight always runs to completion.
pub struct WorkerLoop<Q: ?Sized, P: ?Sized> {
    ctx: WorkerContext<Q, P>,
    shutdown: ShutdownToken,
    cycles: AtomicU64,
}

impl<Q, P> WorkerLoop<Q, P>
where
    Q: WorkQueue + ?Sized,
    P: Processor + ?Sized,
{
    pub fn new(ctx: WorkerContext<Q, P>, shutdown: ShutdownToken) -> Self {
        Self {
            ctx,
            shutdown,
            cycles: AtomicU64::new(0),
        }
    }

    pub fn context(&self) -> &WorkerContext<Q, P> {
        &self.ctx
    }

    pub fn shutdown_token(&self) -> &ShutdownToken {
        &self.shutdown
    }

    /// Run until the shutdown token is cancelled, then publish a final
    /// heartbeat.
    pub async fn run(&self) -> anyhow::Result<()> {
        info!(
            worker_id = %self.ctx.worker_id(),
            poll_interval_secs = self.ctx.config.poll_interval.as_secs(),
            batch_size = self.ctx.config.batch_size,
            "worker loop starting"
        );

        while !self.shutdown.is_cancelled() {
            let report = self.run_cycle().await;
            if let Some(drain) = &report.drain {
                if drain.handled() > 0 {
                    info!(
                        handled = drain.handled(),
                        acknowledged = drain.acknowledged,
                        "batch drained"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.ctx.config.poll_interval) => {}
                _ = self.shutdown.cancelled() => {}
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Heartbeat, recover, then drain unless shutdown was requested.
    pub async fn run_cycle(&self) -> CycleReport {
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed);
        let span = telemetry::worker_cycle_span(self.ctx.worker_id(), cycle);
        async {
            let mut report = CycleReport {
                heartbeat_published: self.publish_heartbeat(HeartbeatStatus::Active).await,
                ..CycleReport::default()
            };
            if let Some(path) = &self.ctx.config.health_file {
                touch_health_file(path, self.ctx.clock.now()).await;
            }

            report.sweep = self.recover().await;

            if self.shutdown.is_cancelled() {
                debug!("shutdown requested, skipping drain");
                return report;
            }
            report.drain = Some(self.drain().await);
            report
        }
        .instrument(span)
        .await
    }

    async fn publish_heartbeat(&self, status: HeartbeatStatus) -> bool {
        match self.ctx.heartbeat.publish(status, &self.ctx.stats).await {
            Ok(_) => true,
            Err(err) => {
                warn!(error = %err, status = ?status, "failed to publish heartbeat");
                false
            }
        }
    }

    async fn recover(&self) -> Option<SweepReport> {
        let span = telemetry::recovery_sweep_span(self.ctx.worker_id());
        match self.ctx.recovery.sweep().instrument(span).await {
            Ok(report) => {
                self.ctx.stats.record_reclaimed(report.reclaimed());
                if report.reclaimed() > 0 {
                    info!(
                        requeued = report.requeued,
                        failed = report.failed,
                        "recovered abandoned jobs"
                    );
                }
                Some(report)
            }
            Err(err) => {
                warn!(error = %err, "recovery sweep failed");
                None
            }
        }
    }

    /// Handle up to `batch_size` items: requeued jobs first, then queue
    /// messages.
    pub async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        let batch_size = self.ctx.config.batch_size.max(1);

        while report.handled() < batch_size {
            if self.shutdown.is_cancelled() {
                report.cancelled = true;
                break;
            }

            match self.claim_requeued().await {
                Ok(Some(record)) => {
                    let job_id = record.job_id.clone();
                    let outcome = self.run_requeued(record).await;
                    report.reclaimed_runs.push((job_id, outcome));
                    continue;
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "failed to claim requeued job"),
            }

            let depth = match self.ctx.queue.depth().await {
                Ok(depth) => depth,
                Err(err) => {
                    warn!(error = %err, "failed to read queue depth");
                    break;
                }
            };
            telemetry::set_queue_depth(depth);
            if depth == 0 {
                break;
            }

            let received = match self
                .ctx
                .queue
                .receive(1, self.ctx.config.receive_wait, self.ctx.policy.lease_duration_std())
                .await
            {
                Ok(received) => received,
                Err(err) => {
                    warn!(error = %err, "failed to receive from queue");
                    break;
                }
            };
            if received.is_empty() {
                break;
            }

            for message in received {
                let disposition = self.handle_message(&message).await;
                if disposition.acknowledges() && self.acknowledge(&message).await {
                    report.acknowledged += 1;
                }
                report.messages.push((message.message_id, disposition));
            }
        }

        report
    }

    /// Claim the oldest job waiting in `Queued`, if any.
    pub async fn claim_requeued(&self) -> Result<Option<JobRecord>, StoreError> {
        for job in self.ctx.store.list_by_status(JobStatus::Queued).await? {
            if !job.is_settled() {
                match self.ctx.store.roll_forward(&job).await {
                    Ok(_) | Err(StoreError::Conflict { .. }) => continue,
                    Err(err) => return Err(err),
                }
            }
            match self
                .ctx
                .leases
                .start_processing(job.job_id(), self.ctx.worker_id())
                .await?
            {
                TransitionOutcome::Applied(record) => {
                    info!(job_id = %record.job_id, attempts = record.attempts, "claimed requeued job");
                    return Ok(Some(record));
                }
                other => debug!(job_id = %job.job_id(), outcome = other.label(), "requeued job not claimed"),
            }
        }
        Ok(None)
    }

    /// Run a claimed requeued job, unless its work key was completed by
    /// another job while it waited.
    async fn run_requeued(&self, record: JobRecord) -> JobOutcome {
        match self.ctx.store.completion(&record.work_key).await {
            Ok(Some(marker)) => return self.complete_from_marker(&record, &marker).await,
            Ok(None) => {}
            Err(err) => warn!(job_id = %record.job_id, error = %err, "failed to check completion marker"),
        }
        self.execute(record).await
    }

    /// Complete a claimed job with an existing marker as its result,
    /// without running the processor.
    async fn complete_from_marker(&self, record: &JobRecord, marker: &CompletionMarker) -> JobOutcome {
        info!(
            job_id = %record.job_id,
            work_key = %record.work_key,
            completed_by = %marker.job_id,
            "work already completed, skipping processor"
        );
        let result = serde_json::to_value(marker).ok();
        match self.ctx.leases.complete(&record.job_id, result).await {
            Ok(TransitionOutcome::Applied(_)) => {
                telemetry::record_job_finished(record.job_id.as_str(), JobOutcome::Completed.as_str());
                JobOutcome::Completed
            }
            Ok(other) => {
                warn!(job_id = %record.job_id, outcome = other.label(), "completion not applied");
                JobOutcome::Lost
            }
            Err(err) => {
                error!(job_id = %record.job_id, error = %err, "failed to record completion");
                JobOutcome::Lost
            }
        }
    }

    /// Decide and act on one message. Does not acknowledge it.
    pub async fn handle_message(&self, message: &ReceivedMessage) -> MessageDisposition {
        let span = telemetry::message_span(&message.message_id, message.receive_count);
        let disposition = self.dispose(message).instrument(span).await;
        telemetry::record_message_disposition(&message.message_id, disposition.label());
        disposition
    }

    async fn dispose(&self, message: &ReceivedMessage) -> MessageDisposition {
        let payload = match MessageBody::parse(&message.body)
            .and_then(|body| body.into_payload(&self.ctx.config.task_param))
        {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "dropping invalid message");
                return MessageDisposition::Invalid;
            }
        };
        if let Err(err) = validate_work_ref(&payload.work_ref) {
            warn!(error = %err, "dropping invalid message");
            return MessageDisposition::Invalid;
        }

        let work_key = WorkKey::derive(&payload.work_ref);
        match self.ctx.store.completion(&work_key).await {
            Ok(Some(marker)) => {
                info!(work_key = %work_key, completed_by = %marker.job_id, "work already completed");
                return MessageDisposition::AlreadyCompleted;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "failed to check completion marker");
                return MessageDisposition::Deferred;
            }
        }

        let job_id = JobId::new(message.message_id.clone());
        match self.ctx.store.get(&job_id).await {
            Ok(Some(existing)) => {
                info!(job_id = %job_id, status = %existing.record.status, "message redelivered for existing job");
                return MessageDisposition::Redelivered;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "failed to look up job");
                return MessageDisposition::Deferred;
            }
        }

        let record = JobRecord::new(job_id.clone(), work_key, payload, self.ctx.clock.now());
        match self.ctx.store.create(&record).await {
            Ok(_) => {}
            Err(StoreError::AlreadyExists { .. }) => return MessageDisposition::Redelivered,
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "failed to create job");
                return MessageDisposition::Deferred;
            }
        }

        let claimed = match self
            .ctx
            .leases
            .start_processing(&job_id, self.ctx.worker_id())
            .await
        {
            Ok(TransitionOutcome::Applied(record)) => record,
            Ok(other) => {
                debug!(job_id = %job_id, outcome = other.label(), "new job claimed elsewhere");
                return MessageDisposition::ClaimedElsewhere;
            }
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "failed to start job");
                return MessageDisposition::Deferred;
            }
        };

        MessageDisposition::Processed(self.execute(claimed).await)
    }

    /// Run the processor on a claimed job and record the terminal status.
    pub async fn execute(&self, record: JobRecord) -> JobOutcome {
        let job_id = record.job_id.clone();
        let timing = telemetry::record_job_start(job_id.as_str());
        let progress = LeaseProgress::new(&self.ctx.leases, &job_id, self.ctx.worker_id());

        let result = telemetry::instrument_process(
            job_id.as_str(),
            record.work_key.as_str(),
            self.ctx.processor.process(&record, &progress),
        )
        .await;

        let outcome = match result {
            Ok(value) => match self.ctx.leases.complete(&job_id, Some(value)).await {
                Ok(TransitionOutcome::Applied(_)) => {
                    self.ctx.stats.record_processed();
                    JobOutcome::Completed
                }
                Ok(other) => {
                    warn!(job_id = %job_id, outcome = other.label(), "completion not applied");
                    JobOutcome::Lost
                }
                Err(err) => {
                    error!(job_id = %job_id, error = %err, "failed to record completion");
                    JobOutcome::Lost
                }
            },
            Err(err) => {
                let message = format!("{err:#}");
                warn!(job_id = %job_id, error = %message, "processor failed");
                match self.ctx.leases.fail(&job_id, &message).await {
                    Ok(TransitionOutcome::Applied(_)) => {
                        self.ctx.stats.record_failed();
                        JobOutcome::Failed
                    }
                    Ok(other) => {
                        warn!(job_id = %job_id, outcome = other.label(), "failure not applied");
                        JobOutcome::Lost
                    }
                    Err(err) => {
                        error!(job_id = %job_id, error = %err, "failed to record failure");
                        JobOutcome::Lost
                    }
                }
            }
        };

        if outcome != JobOutcome::Lost {
            telemetry::record_job_finished(job_id.as_str(), outcome.as_str());
        }
        telemetry::record_job_end(timing, outcome.as_str());
        self.remove_scratch(&record.work_key).await;
        outcome
    }

    async fn remove_scratch(&self, work_key: &WorkKey) {
        let dir = self.ctx.config.scratch_dir(work_key);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(path = %dir.display(), "removed scratch directory"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %dir.display(), error = %err, "failed to remove scratch directory"),
        }
    }

    async fn acknowledge(&self, message: &ReceivedMessage) -> bool {
        match self.ctx.queue.delete(&message.handle).await {
            Ok(()) => true,
            Err(err) => {
                warn!(message_id = %message.message_id, error = %err, "failed to acknowledge message");
                false
            }
        }
    }

    /// Publish the final `shutdown` heartbeat. Failure is logged only.
    pub async fn shutdown(&self) {
        info!(worker_id = %self.ctx.worker_id(), "worker shutting down");
        if self.publish_heartbeat(HeartbeatStatus::Shutdown).await {
            info!(
                jobs_processed = self.ctx.stats.jobs_processed(),
                jobs_failed = self.ctx.stats.jobs_failed(),
                "final heartbeat published"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_deferred_skips_acknowledgment() {
        for disposition in [
            MessageDisposition::Processed(JobOutcome::Completed),
            MessageDisposition::Processed(JobOutcome::Failed),
            MessageDisposition::Processed(JobOutcome::Lost),
            MessageDisposition::Invalid,
            MessageDisposition::AlreadyCompleted,
            MessageDisposition::Redelivered,
            MessageDisposition::ClaimedElsewhere,
        ] {
            assert!(disposition.acknowledges(), "{}", disposition.label());
        }
        assert!(!MessageDisposition::Deferred.acknowledges());
    }

    #[test]
    fn test_drain_report_counts_both_sources() {
        let report = DrainReport {
            reclaimed_runs: vec![(JobId::from("a"), JobOutcome::Completed)],
            messages: vec![("m1".into(), MessageDisposition::Invalid)],
            acknowledged: 1,
            cancelled: false,
        };
        assert_eq!(report.handled(), 2);
    }
}
