use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use object_store::memory::InMemory;
use shepherd::runtime::{WorkerConfig, WorkerContext, WorkerContextBuilder};
use shepherd::{Clock, JobId, JobPayload, JobRecord, JobStore, RetryPolicy, WorkKey};
use uuid::Uuid;

use crate::{FaultyObjectStore, InMemoryWorkQueue, ManualClock, ScriptedProcessor};

/// Fixed start time used across tests.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .expect("valid timestamp")
}

/// Job store over a fresh in-memory object store.
pub fn memory_store() -> JobStore {
    JobStore::new(Arc::new(InMemory::new()))
}

/// A queued record for `job_id`, created at [`t0`].
pub fn queued_record(job_id: &str) -> JobRecord {
    let work_ref = format!("https://example.com/items/{job_id}");
    JobRecord::new(
        JobId::new(job_id),
        WorkKey::derive(&work_ref),
        JobPayload {
            work_ref,
            task_param: "hustle".to_string(),
        },
        t0(),
    )
}

/// A unique scratch root under the system temp directory.
pub fn scratch_root() -> PathBuf {
    std::env::temp_dir().join(format!("shepherd-test-{}", Uuid::new_v4()))
}

/// Worker config with a unique temp dir and a short receive wait.
pub fn worker_config(worker_id: &str) -> WorkerConfig {
    WorkerConfig::new(worker_id)
        .with_temp_dir(scratch_root())
        .with_receive_wait(std::time::Duration::ZERO)
}

/// Everything a worker test touches, sharing one store and clock.
///
/// The store sits on a [`FaultyObjectStore`] so tests can break it.
pub struct TestWorker {
    pub objects: Arc<FaultyObjectStore>,
    pub store: JobStore,
    pub clock: Arc<ManualClock>,
    pub queue: InMemoryWorkQueue,
    pub processor: ScriptedProcessor,
}

impl TestWorker {
    pub fn new() -> Self {
        let objects = Arc::new(FaultyObjectStore::new());
        Self {
            store: JobStore::new(objects.clone()),
            objects,
            clock: Arc::new(ManualClock::new(t0())),
            queue: InMemoryWorkQueue::new(),
            processor: ScriptedProcessor::new(),
        }
    }

    /// Build a context for `config` over the shared store, queue and clock.
    pub fn context(
        &self,
        config: WorkerConfig,
    ) -> WorkerContext<InMemoryWorkQueue, ScriptedProcessor> {
        WorkerContextBuilder::new(config)
            .with_policy(RetryPolicy::default())
            .with_clock(self.clock.clone() as Arc<dyn Clock>)
            .with_store(self.store.clone())
            .with_queue(Arc::new(self.queue.clone()))
            .with_processor(Arc::new(self.processor.clone()))
            .build()
            .expect("all dependencies provided")
    }
}

impl Default for TestWorker {
    fn default() -> Self {
        Self::new()
    }
}
