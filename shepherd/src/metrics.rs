//! Prometheus metrics instrumentation for shepherd.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `shepherd_jobs_finished_total` - Jobs that reached `completed` or `failed`
//! - `shepherd_leases_reclaimed_total` - Abandoned-job recovery outcomes
//! - `shepherd_messages_total` - Received queue messages by disposition
//!
//! ## Gauges
//! - `shepherd_queue_depth` - Last sampled ready-message count
//!
//! ## Histograms
//! - `shepherd_job_duration_seconds` - Processor run duration in seconds
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, Gauge, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for shepherd metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counter for jobs reaching a terminal status.
///
/// Labels:
/// - `status`: `completed` or `failed`
pub static JOBS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "shepherd_jobs_finished_total",
        "Total number of jobs that reached a terminal status",
    );
    CounterVec::new(opts, &["status"]).expect("shepherd_jobs_finished_total metric creation failed")
});

/// Counter for abandoned-job recovery outcomes.
///
/// Labels:
/// - `outcome`: `requeued`, `failed`, `superseded` or `rolled_forward`
pub static LEASES_RECLAIMED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "shepherd_leases_reclaimed_total",
        "Total number of abandoned jobs handled by recovery",
    );
    CounterVec::new(opts, &["outcome"])
        .expect("shepherd_leases_reclaimed_total metric creation failed")
});

/// Counter for received messages.
///
/// Labels:
/// - `disposition`: how the message was handled
pub static MESSAGES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("shepherd_messages_total", "Total number of received queue messages");
    CounterVec::new(opts, &["disposition"]).expect("shepherd_messages_total metric creation failed")
});

/// Gauge for the last sampled queue depth.
pub static QUEUE_DEPTH: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new("shepherd_queue_depth", "Approximate number of ready queue messages")
        .expect("shepherd_queue_depth metric creation failed")
});

/// Histogram for processor run duration in seconds.
///
/// Labels:
/// - `status`: the terminal status the run produced
pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.5, 2.0, 14).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "shepherd_job_duration_seconds",
        "Processor run duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["status"]).expect("shepherd_job_duration_seconds metric creation failed")
});

/// Register all metrics with the global registry.
///
/// Calling it more than once is safe.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_FINISHED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(LEASES_RECLAIMED_TOTAL.clone()),
        Box::new(MESSAGES_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_finished(status: &str) {
    JOBS_FINISHED_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_lease_reclaimed(outcome: &str) {
    LEASES_RECLAIMED_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_message_disposition(disposition: &str) {
    MESSAGES_TOTAL.with_label_values(&[disposition]).inc();
}

pub fn set_queue_depth(depth: f64) {
    QUEUE_DEPTH.set(depth);
}

pub fn observe_job_duration(status: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
