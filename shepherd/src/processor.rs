use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::job::{JobId, JobRecord, Progress};
use crate::lease::LeaseManager;
use crate::runtime::WorkerConfig;

/// The unit of work a worker runs for each claimed job.
///
/// Implementations own any retrying of transient failures; an error
/// returned here is recorded on the job and is terminal for it.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Run the job and return completion evidence to store on the record.
    async fn process(
        &self,
        job: &JobRecord,
        progress: &dyn ProgressReporter,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Progress callback handed to a running [`Processor`].
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    /// Record that `completed` of `total` units are done.
    async fn report(&self, total: u32, completed: u32) -> anyhow::Result<()>;
}

/// Reports progress by renewing the worker's lease on the job.
#[derive(Debug)]
pub struct LeaseProgress<'a> {
    leases: &'a LeaseManager,
    job_id: &'a JobId,
    worker_id: &'a str,
}

impl<'a> LeaseProgress<'a> {
    pub fn new(leases: &'a LeaseManager, job_id: &'a JobId, worker_id: &'a str) -> Self {
        Self {
            leases,
            job_id,
            worker_id,
        }
    }
}

#[async_trait]
impl ProgressReporter for LeaseProgress<'_> {
    async fn report(&self, total: u32, completed: u32) -> anyhow::Result<()> {
        let progress = Progress {
            total_units: total,
            completed_units: completed.min(total),
        };
        let outcome = self
            .leases
            .renew(self.job_id, self.worker_id, Some(progress))
            .await?;
        if !outcome.is_applied() {
            debug!(
                job_id = %self.job_id,
                outcome = outcome.label(),
                "progress renewal not applied"
            );
        }
        Ok(())
    }
}

/// Progress sink that drops every report.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopProgress;

#[async_trait]
impl ProgressReporter for NoopProgress {
    async fn report(&self, _total: u32, _completed: u32) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Runs an external program for each job.
///
/// The program is called as `<program> [args..] <work_ref> <task_param>` with
/// `SHEPHERD_JOB_ID`, `SHEPHERD_WORK_KEY`, `SHEPHERD_SCRATCH_DIR` and
/// `SHEPHERD_USE_GPU` set. Stdout lines of the form `progress <done>/<total>`
/// are forwarded to the progress reporter. The last other non-empty line is
/// the result: parsed as JSON when possible, kept as a string otherwise.
/// A non-zero exit status fails the job. Stderr is passed through.
#[derive(Clone, Debug)]
pub struct CommandProcessor {
    program: String,
    args: Vec<String>,
    config: WorkerConfig,
}

impl CommandProcessor {
    /// Split a whitespace-separated command line into program and arguments.
    pub fn parse(command_line: &str, config: &WorkerConfig) -> anyhow::Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("processor command is empty"))?;
        Ok(Self {
            program,
            args: parts.collect(),
            config: config.clone(),
        })
    }
}

#[async_trait]
impl Processor for CommandProcessor {
    async fn process(
        &self,
        job: &JobRecord,
        progress: &dyn ProgressReporter,
    ) -> anyhow::Result<serde_json::Value> {
        let scratch = self.config.scratch_dir(&job.work_key);
        tokio::fs::create_dir_all(&scratch)
            .await
            .with_context(|| format!("failed to create {}", scratch.display()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&job.payload.work_ref)
            .arg(&job.payload.task_param)
            .env("SHEPHERD_JOB_ID", job.job_id.as_str())
            .env("SHEPHERD_WORK_KEY", job.work_key.as_str())
            .env("SHEPHERD_SCRATCH_DIR", &scratch)
            .env("SHEPHERD_USE_GPU", if self.config.use_gpu { "1" } else { "0" })
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", self.program))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("processor stdout was not captured"))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut last_line = None;
        while let Some(line) = lines.next_line().await? {
            match parse_progress(&line) {
                Some((completed, total)) => {
                    if let Err(err) = progress.report(total, completed).await {
                        warn!(job_id = %job.job_id, error = %err, "failed to report progress");
                    }
                }
                None if !line.trim().is_empty() => last_line = Some(line),
                None => {}
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            anyhow::bail!("{} exited with {status}", self.program);
        }

        Ok(match last_line {
            Some(line) => serde_json::from_str(&line).unwrap_or(serde_json::Value::String(line)),
            None => serde_json::Value::Null,
        })
    }
}

/// Parses `progress <done>/<total>`.
fn parse_progress(line: &str) -> Option<(u32, u32)> {
    let rest = line.trim().strip_prefix("progress ")?;
    let (done, total) = rest.split_once('/')?;
    Some((done.trim().parse().ok()?, total.trim().parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use object_store::memory::InMemory;

    use crate::clock::SystemClock;
    use crate::job::{JobPayload, JobStatus, WorkKey};
    use crate::lease::RetryPolicy;
    use crate::store::JobStore;

    #[test]
    fn test_parse_progress() {
        assert_eq!(parse_progress("progress 3/10"), Some((3, 10)));
        assert_eq!(parse_progress("  progress 0 / 4 "), Some((0, 4)));
        assert_eq!(parse_progress("progress x/4"), None);
        assert_eq!(parse_progress("{\"count\": 2}"), None);
    }

    #[test]
    fn test_parse_command_line() {
        let config = WorkerConfig::new("w1");
        let processor = CommandProcessor::parse("python3 -m transcribe --fast", &config).unwrap();
        assert_eq!(processor.program, "python3");
        assert_eq!(processor.args, vec!["-m", "transcribe", "--fast"]);
        assert!(CommandProcessor::parse("   ", &config).is_err());
    }

    fn shell(script: &str) -> CommandProcessor {
        let temp = std::env::temp_dir().join(format!("shepherd-proc-{}", uuid::Uuid::new_v4()));
        CommandProcessor {
            program: "sh".into(),
            args: vec!["-c".into(), script.into(), "sh".into()],
            config: WorkerConfig::new("w1").with_temp_dir(temp),
        }
    }

    fn sample_job() -> JobRecord {
        JobRecord::new(
            JobId::from("j1"),
            WorkKey::new("a1Ih5GGtR8Q"),
            JobPayload {
                work_ref: "https://youtu.be/a1Ih5GGtR8Q".into(),
                task_param: "hustle".into(),
            },
            Utc::now(),
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_processor_parses_result() {
        let processor = shell(r#"echo progress 1/2; echo "{\"task\": \"$2\"}""#);
        let value = processor.process(&sample_job(), &NoopProgress).await.unwrap();
        assert_eq!(value, serde_json::json!({ "task": "hustle" }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_processor_fails_on_exit_status() {
        let processor = shell("echo partial; exit 3");
        let err = processor.process(&sample_job(), &NoopProgress).await.unwrap_err();
        assert!(err.to_string().contains("exited with"));
    }

    #[tokio::test]
    async fn test_lease_progress_records_units() {
        let store = JobStore::new(Arc::new(InMemory::new()));
        let job_id = JobId::from("j1");
        let record = JobRecord::new(
            job_id.clone(),
            WorkKey::new("k"),
            JobPayload {
                work_ref: "k".into(),
                task_param: "p".into(),
            },
            Utc::now(),
        );
        store.create(&record).await.unwrap();
        let leases = LeaseManager::new(store.clone(), RetryPolicy::default(), Arc::new(SystemClock));
        leases.start_processing(&job_id, "w1").await.unwrap();

        let reporter = LeaseProgress::new(&leases, &job_id, "w1");
        reporter.report(8, 3).await.unwrap();

        let stored = store
            .get_by_status(&job_id, JobStatus::Processing)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stored.record.progress,
            Some(Progress {
                total_units: 8,
                completed_units: 3
            })
        );
    }

    #[tokio::test]
    async fn test_progress_for_missing_job_is_ignored() {
        let store = JobStore::new(Arc::new(InMemory::new()));
        let leases = LeaseManager::new(store, RetryPolicy::default(), Arc::new(SystemClock));
        let job_id = JobId::from("missing");

        let reporter = LeaseProgress::new(&leases, &job_id, "w1");
        reporter.report(1, 1).await.unwrap();
    }
}
