use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::WorkKey;

/// Configuration for a single worker process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Unique identifier for this worker.
    pub worker_id: String,
    /// Task parameter applied to messages that do not carry one.
    pub task_param: String,
    /// Root for per-job scratch directories.
    pub temp_dir: PathBuf,
    /// Whether processors should use a GPU.
    pub use_gpu: bool,
    /// Maximum number of jobs handled per drain.
    pub batch_size: usize,
    /// Sleep between loop cycles.
    pub poll_interval: Duration,
    /// Long-poll wait for a single queue receive.
    pub receive_wait: Duration,
    /// File touched after every heartbeat, for container health checks.
    pub health_file: Option<PathBuf>,
}

impl WorkerConfig {
    /// Create a new worker configuration with the given worker ID.
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Self::default()
        }
    }

    /// A fresh `worker-<uuid>` identifier.
    pub fn generate_worker_id() -> String {
        format!("worker-{}", Uuid::new_v4())
    }

    pub fn with_task_param(mut self, task_param: impl Into<String>) -> Self {
        self.task_param = task_param.into();
        self
    }

    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = temp_dir.into();
        self
    }

    pub fn with_gpu(mut self, use_gpu: bool) -> Self {
        self.use_gpu = use_gpu;
        self
    }

    /// Set the batch size. Zero is raised to one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    pub fn with_health_file(mut self, path: Option<PathBuf>) -> Self {
        self.health_file = path;
        self
    }

    /// Scratch directory for one unit of work.
    ///
    /// The readable part of the name is lossy, so it carries a short digest
    /// of the full key to keep distinct keys apart.
    pub fn scratch_dir(&self, work_key: &WorkKey) -> PathBuf {
        let key = work_key.as_str();
        let digest = Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).simple().to_string();
        self.temp_dir.join(format!("{}-{}", sanitize(key), &digest[..8]))
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: Self::generate_worker_id(),
            task_param: "hustle".to_string(),
            temp_dir: PathBuf::from("./temp"),
            use_gpu: true,
            batch_size: 5,
            poll_interval: Duration::from_secs(60),
            receive_wait: Duration::from_secs(5),
            health_file: None,
        }
    }
}

fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.task_param, "hustle");
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.receive_wait, Duration::from_secs(5));
        assert!(config.use_gpu);
    }

    #[test]
    fn test_zero_batch_is_raised() {
        let config = WorkerConfig::new("w1").with_batch_size(0);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.worker_id, "w1");
    }

    #[test]
    fn test_scratch_dir_is_flat() {
        let config = WorkerConfig::new("w1").with_temp_dir("/tmp/shepherd");
        let dir = config.scratch_dir(&WorkKey::new("s3://bucket/a.mp3"));
        assert_eq!(dir.parent(), Some(std::path::Path::new("/tmp/shepherd")));
        let name = dir.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("s3___bucket_a_mp3-"));
        assert_eq!(name.len(), "s3___bucket_a_mp3-".len() + 8);
        assert_eq!(dir, config.scratch_dir(&WorkKey::new("s3://bucket/a.mp3")));
    }

    #[test]
    fn test_scratch_dirs_do_not_collide() {
        let config = WorkerConfig::new("w1").with_temp_dir("/tmp/shepherd");
        let dirs: std::collections::HashSet<_> = ["a/b", "a_b", "a.b"]
            .into_iter()
            .map(|key| config.scratch_dir(&WorkKey::new(key)))
            .collect();
        assert_eq!(dirs.len(), 3);
    }
}
