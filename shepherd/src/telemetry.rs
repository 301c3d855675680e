//! Tracing and telemetry instrumentation for shepherd.
//!
//! Helpers for creating tracing spans and recording job lifecycle events.
//! Every function works with and without the `metrics` feature flag; with it
//! enabled the events are also counted in the Prometheus registry.
//!
//! # Example
//!
//! ```ignore
//! use shepherd::telemetry::{instrument_process, record_job_start, record_job_end};
//!
//! let timing = record_job_start(job.job_id.as_str());
//! let result = instrument_process(job.job_id.as_str(), job.work_key.as_str(), run(job)).await;
//! record_job_end(timing, "completed");
//! ```

use std::future::Future;
use tracing::{info_span, Instrument, Level, Span};

/// Create a tracing span around one processor invocation.
///
/// # Arguments
/// * `job_id` - The job identifier
/// * `work_key` - The logical unit of work
#[must_use]
pub fn job_process_span(job_id: impl AsRef<str>, work_key: impl AsRef<str>) -> Span {
    info_span!(
        "shepherd.process",
        job_id = %job_id.as_ref(),
        work_key = %work_key.as_ref(),
    )
}

/// Create a tracing span for handling one received queue message.
#[must_use]
pub fn message_span(message_id: impl AsRef<str>, receive_count: u32) -> Span {
    info_span!(
        "shepherd.message",
        message_id = %message_id.as_ref(),
        receive_count = receive_count,
    )
}

/// Create a tracing span for one abandoned-job recovery sweep.
#[must_use]
pub fn recovery_sweep_span(worker_id: impl AsRef<str>) -> Span {
    info_span!("shepherd.recovery", worker_id = %worker_id.as_ref())
}

/// Create a tracing span for one worker loop cycle.
#[must_use]
pub fn worker_cycle_span(worker_id: impl AsRef<str>, cycle: u64) -> Span {
    info_span!(
        "shepherd.cycle",
        worker_id = %worker_id.as_ref(),
        cycle = cycle,
    )
}

/// Instrument a future with a processor span.
pub fn instrument_process<F>(
    job_id: impl AsRef<str>,
    work_key: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let span = job_process_span(job_id, work_key);
    future.instrument(span)
}

/// Record a job reaching a terminal status.
///
/// # Arguments
/// * `job_id` - The job identifier
/// * `status` - `completed` or `failed`
pub fn record_job_finished(job_id: impl AsRef<str>, status: impl AsRef<str>) {
    tracing::info!(
        job_id = %job_id.as_ref(),
        status = %status.as_ref(),
        "job finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_finished(status.as_ref());
}

/// Record the outcome of reclaiming an abandoned job.
///
/// # Arguments
/// * `job_id` - The job identifier
/// * `outcome` - `requeued`, `failed`, `superseded` or `rolled_forward`
/// * `attempts` - Attempt count after the reclaim
pub fn record_lease_reclaimed(job_id: impl AsRef<str>, outcome: impl AsRef<str>, attempts: u32) {
    let (job_id, outcome) = (job_id.as_ref(), outcome.as_ref());
    let (level, message) = reclaim_event(outcome);
    if level == Level::DEBUG {
        tracing::debug!(job_id = %job_id, outcome = %outcome, attempts = attempts, "{message}");
    } else if level == Level::INFO {
        tracing::info!(job_id = %job_id, outcome = %outcome, attempts = attempts, "{message}");
    } else {
        tracing::warn!(job_id = %job_id, outcome = %outcome, attempts = attempts, "{message}");
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_lease_reclaimed(outcome);
}

/// Log level and message for a reclaim outcome.
fn reclaim_event(outcome: &str) -> (Level, &'static str) {
    match outcome {
        "requeued" => (Level::WARN, "abandoned job requeued"),
        "failed" => (Level::WARN, "abandoned job failed after exhausting retries"),
        "rolled_forward" => (Level::INFO, "interrupted job move finished"),
        "superseded" => (Level::DEBUG, "abandoned job already reclaimed elsewhere"),
        _ => (Level::WARN, "abandoned job reclaimed"),
    }
}

/// Record how a received message was disposed of.
pub fn record_message_disposition(message_id: impl AsRef<str>, disposition: impl AsRef<str>) {
    tracing::debug!(
        message_id = %message_id.as_ref(),
        disposition = %disposition.as_ref(),
        "message handled"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_message_disposition(disposition.as_ref());
}

/// Update the queue depth metric.
pub fn set_queue_depth(depth: u64) {
    tracing::debug!(depth = depth, "queue depth sampled");

    #[cfg(feature = "metrics")]
    crate::metrics::set_queue_depth(depth as f64);
}

/// Observe the duration of a processor run.
///
/// # Arguments
/// * `status` - The terminal status the run produced
/// * `duration_secs` - The duration in seconds
pub fn observe_job_duration(status: impl AsRef<str>, duration_secs: f64) {
    tracing::debug!(
        status = %status.as_ref(),
        duration_secs = duration_secs,
        "job duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job_duration(status.as_ref(), duration_secs);
}

/// Record the start of job execution for duration tracking.
///
/// Returns an opaque handle that should be passed to `record_job_end`.
pub fn record_job_start(job_id: impl AsRef<str>) -> JobTimingHandle {
    JobTimingHandle {
        job_id: job_id.as_ref().to_string(),
        start: std::time::Instant::now(),
    }
}

/// Record the end of job execution and update duration metrics.
pub fn record_job_end(handle: JobTimingHandle, status: impl AsRef<str>) {
    observe_job_duration(status, handle.start.elapsed().as_secs_f64());
}

/// Handle for tracking job execution duration.
///
/// Returned by `record_job_start` and consumed by `record_job_end`.
#[derive(Debug)]
pub struct JobTimingHandle {
    job_id: String,
    start: std::time::Instant,
}

impl JobTimingHandle {
    /// Get the job ID associated with this timing handle.
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Get the elapsed time since the job started.
    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_process_span() {
        let span = job_process_span("job-123", "a1Ih5GGtR8Q");
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "shepherd.process");
        }
    }

    #[test]
    fn test_message_span() {
        let span = message_span("msg-1", 2);
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "shepherd.message");
        }
    }

    #[test]
    fn test_recovery_and_cycle_spans() {
        let sweep = recovery_sweep_span("worker-1");
        let cycle = worker_cycle_span("worker-1", 7);
        if let (Some(a), Some(b)) = (sweep.metadata(), cycle.metadata()) {
            assert_eq!(a.name(), "shepherd.recovery");
            assert_eq!(b.name(), "shepherd.cycle");
        }
    }

    #[tokio::test]
    async fn test_instrument_process_passes_output_through() {
        let value = instrument_process("job-1", "key", async { 41 + 1 }).await;
        assert_eq!(value, 42);
    }

    #[test]
    fn test_timing_handle() {
        let handle = record_job_start("job-123");
        assert_eq!(handle.job_id(), "job-123");

        std::thread::sleep(std::time::Duration::from_millis(1));
        assert!(handle.elapsed().as_nanos() > 0);

        record_job_end(handle, "completed");
    }

    #[test]
    fn test_record_helpers_do_not_panic() {
        record_job_finished("job-1", "failed");
        record_lease_reclaimed("job-1", "requeued", 1);
        record_message_disposition("msg-1", "processed");
        set_queue_depth(3);
    }

    #[test]
    fn test_reclaim_event_levels() {
        assert_eq!(reclaim_event("superseded").0, Level::DEBUG);
        assert_eq!(reclaim_event("rolled_forward").0, Level::INFO);
        assert_eq!(reclaim_event("requeued").0, Level::WARN);
        assert_ne!(reclaim_event("requeued").1, reclaim_event("failed").1);
    }
}
