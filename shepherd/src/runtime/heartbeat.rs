use std::path::Path as FsPath;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use object_store::path::Path;
use object_store::PutMode;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::Clock;
use crate::runtime::worker::WorkerConfig;
use crate::store::{read_json, write_json, JobStore, StoreError};

/// Liveness state advertised by a worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    Active,
    Shutdown,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HostIdentity {
    pub hostname: String,
    pub pid: u32,
}

impl HostIdentity {
    /// Identity of the current process.
    pub fn current() -> Self {
        let hostname = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
            })
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            hostname,
            pid: std::process::id(),
        }
    }
}

/// Worker settings echoed in every heartbeat.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub task_param: String,
    pub use_gpu: bool,
    pub batch_size: usize,
    pub poll_interval_secs: u64,
}

impl From<&WorkerConfig> for ConfigSnapshot {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            task_param: config.task_param.clone(),
            use_gpu: config.use_gpu,
            batch_size: config.batch_size,
            poll_interval_secs: config.poll_interval.as_secs(),
        }
    }
}

/// Snapshot stored at `workers/{worker_id}`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub host_identity: HostIdentity,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: HeartbeatStatus,
    pub jobs_processed: u64,
    #[serde(default)]
    pub jobs_failed: u64,
    #[serde(default)]
    pub jobs_reclaimed: u64,
    pub config_snapshot: ConfigSnapshot,
}

/// Monotonic per-process job counters.
#[derive(Debug, Default)]
pub struct WorkerStats {
    jobs_processed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_reclaimed: AtomicU64,
}

impl WorkerStats {
    pub fn record_processed(&self) {
        self.jobs_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reclaimed(&self, count: u64) {
        self.jobs_reclaimed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn jobs_processed(&self) -> u64 {
        self.jobs_processed.load(Ordering::Relaxed)
    }

    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }

    pub fn jobs_reclaimed(&self) -> u64 {
        self.jobs_reclaimed.load(Ordering::Relaxed)
    }
}

/// Overwrites the worker's heartbeat object with its current state.
#[derive(Debug)]
pub struct HeartbeatPublisher {
    store: JobStore,
    worker_id: String,
    host: HostIdentity,
    config: ConfigSnapshot,
    started_at: DateTime<Utc>,
    clock: Arc<dyn Clock>,
    last_published: Mutex<Option<DateTime<Utc>>>,
}

impl HeartbeatPublisher {
    pub fn new(store: JobStore, config: &WorkerConfig, clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.now();
        Self {
            store,
            worker_id: config.worker_id.clone(),
            host: HostIdentity::current(),
            config: ConfigSnapshot::from(config),
            started_at,
            clock,
            last_published: Mutex::new(None),
        }
    }

    pub fn key(worker_id: &str) -> Path {
        Path::from_iter(["workers", worker_id])
    }

    /// Publish a heartbeat. `last_heartbeat` never goes backwards, even if
    /// the clock does.
    pub async fn publish(
        &self,
        status: HeartbeatStatus,
        stats: &WorkerStats,
    ) -> Result<WorkerHeartbeat, StoreError> {
        let now = self.clock.now();
        let last_heartbeat = {
            let last = self.last_published.lock();
            last.map_or(now, |previous| previous.max(now))
        };

        let heartbeat = WorkerHeartbeat {
            worker_id: self.worker_id.clone(),
            host_identity: self.host.clone(),
            started_at: self.started_at,
            last_heartbeat,
            status,
            jobs_processed: stats.jobs_processed(),
            jobs_failed: stats.jobs_failed(),
            jobs_reclaimed: stats.jobs_reclaimed(),
            config_snapshot: self.config.clone(),
        };

        let key = Self::key(&self.worker_id);
        write_json(self.store.objects(), &key, &heartbeat, PutMode::Overwrite).await?;
        {
            let mut last = self.last_published.lock();
            *last = Some(last.map_or(last_heartbeat, |previous| previous.max(last_heartbeat)));
        }
        debug!(worker_id = %self.worker_id, status = ?status, "heartbeat published");
        Ok(heartbeat)
    }

    /// Read the stored heartbeat for any worker.
    pub async fn load(store: &JobStore, worker_id: &str) -> Result<Option<WorkerHeartbeat>, StoreError> {
        Ok(read_json(store.objects(), &Self::key(worker_id))
            .await?
            .map(|(heartbeat, _)| heartbeat))
    }
}

/// Writes `Heartbeat at <timestamp>` to a container health-check file.
///
/// Errors are logged and otherwise ignored.
pub async fn touch_health_file(path: &FsPath, now: DateTime<Utc>) {
    let contents = format!("Heartbeat at {}", now.to_rfc3339());
    if let Err(err) = tokio::fs::write(path, contents).await {
        debug!(path = %path.display(), error = %err, "failed to update health file");
    }
}
