use std::any::type_name;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::job::JobStatus;
use crate::lease::{LeaseManager, RetryPolicy};
use crate::processor::Processor;
use crate::queue::WorkQueue;
use crate::recovery::AbandonedJobRecovery;
use crate::store::{JobStore, StoreError};

use super::heartbeat::{HeartbeatPublisher, WorkerStats};
use super::worker::WorkerConfig;

/// Fatal startup failures. The process exits and an external supervisor
/// restarts it.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("job store is unreachable")]
    StoreUnavailable(#[source] StoreError),

    #[error("work queue is unreachable: {0:#}")]
    QueueUnavailable(anyhow::Error),

    #[error("cannot create temp directory {path}")]
    TempDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Everything one worker needs, constructed once and passed by reference.
pub struct WorkerContext<Q: ?Sized, P: ?Sized> {
    pub config: WorkerConfig,
    pub policy: RetryPolicy,
    pub clock: Arc<dyn Clock>,
    pub store: JobStore,
    pub queue: Arc<Q>,
    pub processor: Arc<P>,
    pub leases: LeaseManager,
    pub recovery: AbandonedJobRecovery,
    pub heartbeat: HeartbeatPublisher,
    pub stats: WorkerStats,
}

impl<Q: ?Sized, P: ?Sized> fmt::Debug for WorkerContext<Q, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("config", &self.config)
            .field("policy", &self.policy)
            .field("queue_type", &type_name::<Q>())
            .field("processor_type", &type_name::<P>())
            .field("stats", &self.stats)
            .finish()
    }
}

impl<Q, P> WorkerContext<Q, P>
where
    Q: WorkQueue + ?Sized,
    P: Processor + ?Sized,
{
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Verify the store and queue are reachable and the temp root exists.
    pub async fn initialize(&self) -> Result<(), WorkerError> {
        tokio::fs::create_dir_all(&self.config.temp_dir)
            .await
            .map_err(|source| WorkerError::TempDir {
                path: self.config.temp_dir.clone(),
                source,
            })?;
        self.store
            .list_by_status(JobStatus::Queued)
            .await
            .map_err(WorkerError::StoreUnavailable)?;
        let depth = self
            .queue
            .depth()
            .await
            .map_err(WorkerError::QueueUnavailable)?;

        info!(
            worker_id = %self.config.worker_id,
            queue_depth = depth,
            temp_dir = %self.config.temp_dir.display(),
            "worker initialized"
        );
        Ok(())
    }
}

/// Builder for a [`WorkerContext`].
///
/// The store, queue and processor are required; the clock defaults to
/// [`SystemClock`] and the policy to [`RetryPolicy::default`].
///
/// # Example
///
/// ```ignore
/// let ctx = WorkerContextBuilder::new(config)
///     .with_store(store)
///     .with_queue(queue)
///     .with_processor(processor)
///     .build()?;
/// ```
pub struct WorkerContextBuilder<Q: ?Sized, P: ?Sized> {
    config: WorkerConfig,
    policy: RetryPolicy,
    clock: Option<Arc<dyn Clock>>,
    store: Option<JobStore>,
    queue: Option<Arc<Q>>,
    processor: Option<Arc<P>>,
}

impl<Q: ?Sized, P: ?Sized> fmt::Debug for WorkerContextBuilder<Q, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("WorkerContextBuilder");
        debug.field("config", &self.config);
        debug.field("policy", &self.policy);
        debug.field("clock_set", &self.clock.is_some());
        debug.field("store_set", &self.store.is_some());
        debug.field("queue_set", &self.queue.is_some());
        debug.field("processor_set", &self.processor.is_some());

        if self.queue.is_some() {
            debug.field("queue_type", &type_name::<Q>());
        }
        if self.processor.is_some() {
            debug.field("processor_type", &type_name::<P>());
        }

        debug.finish()
    }
}

impl<Q, P> WorkerContextBuilder<Q, P>
where
    Q: WorkQueue + ?Sized,
    P: Processor + ?Sized,
{
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            policy: RetryPolicy::default(),
            clock: None,
            store: None,
            queue: None,
            processor: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_store(mut self, store: JobStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_queue(mut self, queue: Arc<Q>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_processor(mut self, processor: Arc<P>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// # Errors
    ///
    /// Returns an error if any required dependency is missing.
    pub fn build(self) -> anyhow::Result<WorkerContext<Q, P>> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;
        let queue = self
            .queue
            .ok_or_else(|| anyhow::anyhow!("queue dependency missing"))?;
        let processor = self
            .processor
            .ok_or_else(|| anyhow::anyhow!("processor dependency missing"))?;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);

        let leases = LeaseManager::new(store.clone(), self.policy, clock.clone());
        let recovery = AbandonedJobRecovery::new(store.clone(), self.policy, clock.clone());
        let heartbeat = HeartbeatPublisher::new(store.clone(), &self.config, clock.clone());

        Ok(WorkerContext {
            config: self.config,
            policy: self.policy,
            clock,
            store,
            queue,
            processor,
            leases,
            recovery,
            heartbeat,
            stats: WorkerStats::default(),
        })
    }
}
