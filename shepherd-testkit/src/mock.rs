use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use shepherd::{JobId, JobRecord, Processor, ProgressReporter};
use tokio::sync::Notify;

/// One call observed by a [`ScriptedProcessor`].
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessCall {
    pub job_id: JobId,
    pub work_ref: String,
    pub task_param: String,
    pub attempts: u32,
}

#[derive(Clone, Debug)]
enum Scripted {
    Succeed(Value),
    Fail(String),
}

/// Processor that replays canned results in order.
///
/// Once the script runs out every call succeeds with the default result.
/// Progress steps, when set, are reported before each call returns.
#[derive(Clone)]
pub struct ScriptedProcessor {
    calls: Arc<Mutex<Vec<ProcessCall>>>,
    script: Arc<Mutex<VecDeque<Scripted>>>,
    default_result: Arc<Mutex<Value>>,
    progress_steps: Arc<Mutex<Vec<(u32, u32)>>>,
    gate: Arc<Mutex<Option<Arc<Notify>>>>,
}

impl ScriptedProcessor {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(VecDeque::new())),
            default_result: Arc::new(Mutex::new(serde_json::json!({ "count": 0 }))),
            progress_steps: Arc::new(Mutex::new(Vec::new())),
            gate: Arc::new(Mutex::new(None)),
        }
    }

    pub fn then_succeed(&self, result: Value) -> &Self {
        self.script.lock().push_back(Scripted::Succeed(result));
        self
    }

    pub fn then_fail(&self, error: &str) -> &Self {
        self.script.lock().push_back(Scripted::Fail(error.to_string()));
        self
    }

    /// Report these `(completed, total)` steps during every call.
    pub fn with_progress(&self, steps: &[(u32, u32)]) -> &Self {
        *self.progress_steps.lock() = steps.to_vec();
        self
    }

    /// Hold every call until `gate` is notified.
    pub fn hold_until(&self, gate: Arc<Notify>) {
        *self.gate.lock() = Some(gate);
    }

    pub fn calls(&self) -> Vec<ProcessCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        let actual = self.call_count();
        assert_eq!(actual, expected, "expected {expected} processor calls, got {actual}");
    }

    pub fn assert_processed(&self, job_id: &str) {
        assert!(
            self.calls.lock().iter().any(|c| c.job_id.as_str() == job_id),
            "job {job_id} was never processed"
        );
    }
}

impl Default for ScriptedProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for ScriptedProcessor {
    async fn process(
        &self,
        job: &JobRecord,
        progress: &dyn ProgressReporter,
    ) -> anyhow::Result<Value> {
        self.calls.lock().push(ProcessCall {
            job_id: job.job_id.clone(),
            work_ref: job.payload.work_ref.clone(),
            task_param: job.payload.task_param.clone(),
            attempts: job.attempts,
        });

        let steps = self.progress_steps.lock().clone();
        for (completed, total) in steps {
            progress.report(total, completed).await?;
        }

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let next = self.script.lock().pop_front();
        match next {
            Some(Scripted::Succeed(value)) => Ok(value),
            Some(Scripted::Fail(error)) => Err(anyhow::anyhow!(error)),
            None => Ok(self.default_result.lock().clone()),
        }
    }
}
