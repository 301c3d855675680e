use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use shepherd::runtime::{
    spawn_preemption_watch, spawn_signal_listener, HttpPreemptionProbe, ShutdownToken,
    WorkerConfig, WorkerContextBuilder, WorkerLoop, SPOT_TERMINATION_URL,
};
use shepherd::{
    validate_work_ref, CommandProcessor, JobId, JobStore, MessageBody, Processor, StoreConfig,
    WorkQueue,
};

/// How often the preemption endpoint is polled.
const PREEMPTION_POLL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "shepherd")]
#[command(version)]
#[command(about = "Lease-based worker for queue-fed jobs")]
#[command(propagate_version = true)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the worker loop until interrupted
    Run(RunArgs),

    /// Send a work item to the queue
    Enqueue {
        /// Reference to the item to process (e.g. a media URL)
        #[arg(long)]
        work_ref: String,

        /// Task parameter for this item; workers apply their own default when omitted
        #[arg(long)]
        task_param: Option<String>,
    },

    /// Print the current record of a job
    Status {
        /// Job identifier (the queue message id)
        job_id: String,
    },
}

#[derive(Parser, Debug)]
struct CommonArgs {
    /// PostgreSQL URL of the work queue
    #[arg(short = 'q', long, env = "SHEPHERD_QUEUE_URL")]
    queue_url: Option<String>,

    /// Queue name within the work queue database
    #[arg(long, env = "SHEPHERD_QUEUE_NAME", default_value = "shepherd-work")]
    queue_name: String,

    /// Bucket holding job records, used when --store-url is not given
    #[arg(short = 'b', long, env = "SHEPHERD_BUCKET", default_value = "youtube-transcripts")]
    bucket: String,

    /// Object store URL (s3://bucket[/prefix] or memory://)
    #[arg(long, env = "SHEPHERD_STORE_URL")]
    store_url: Option<String>,

    /// Region of the object store
    #[arg(short = 'r', long, env = "SHEPHERD_REGION", default_value = "us-east-1")]
    region: String,

    /// Log output format
    #[arg(long, env = "SHEPHERD_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Command run for every job; receives the work reference and task parameter
    #[arg(long, env = "SHEPHERD_PROCESSOR_CMD")]
    processor_cmd: String,

    /// Default task parameter for messages that carry none
    #[arg(short = 'p', long, env = "SHEPHERD_TASK_PARAM", default_value = "hustle")]
    task_param: String,

    /// Root directory for per-job scratch space
    #[arg(short = 't', long, env = "SHEPHERD_TEMP_DIR", default_value = "./temp")]
    temp_dir: PathBuf,

    /// Maximum jobs handled per cycle
    #[arg(short = 'n', long, env = "SHEPHERD_BATCH_SIZE", default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    batch_size: u32,

    /// Seconds to sleep between cycles
    #[arg(short = 'i', long, env = "SHEPHERD_POLL_INTERVAL", default_value_t = 60)]
    poll_interval: u64,

    /// Disable GPU use in the processor
    #[arg(long, env = "SHEPHERD_CPU")]
    cpu: bool,

    /// Worker identifier; generated when omitted
    #[arg(long, env = "SHEPHERD_WORKER_ID")]
    worker_id: Option<String>,

    /// File touched after every heartbeat for container health checks
    #[arg(long, env = "SHEPHERD_HEALTH_FILE")]
    health_file: Option<PathBuf>,

    /// Poll the instance metadata endpoint for spot termination notices
    #[arg(long, env = "SHEPHERD_WATCH_PREEMPTION")]
    watch_preemption: bool,

    /// Termination notice endpoint, implies --watch-preemption
    #[arg(long, env = "SHEPHERD_PREEMPTION_URL")]
    preemption_url: Option<String>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

impl CommonArgs {
    fn store(&self) -> anyhow::Result<JobStore> {
        let config = match &self.store_url {
            Some(url) => StoreConfig::new(url, &self.region),
            None => StoreConfig::for_bucket(&self.bucket, &self.region),
        };
        let objects = config
            .open()
            .with_context(|| format!("failed to open store {}", config.url))?;
        Ok(JobStore::new(objects))
    }

    async fn queue(&self) -> anyhow::Result<Arc<dyn WorkQueue>> {
        let url = self
            .queue_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("--queue-url is required"))?;
        connect_queue(url, &self.queue_name).await
    }
}

#[cfg(feature = "postgres")]
async fn connect_queue(url: &str, queue_name: &str) -> anyhow::Result<Arc<dyn WorkQueue>> {
    use shepherd::persistence::PostgresWorkQueue;
    use shepherd::PersistenceConfig;

    let queue = PostgresWorkQueue::connect(&PersistenceConfig::new(url), queue_name)
        .await
        .context("failed to connect to work queue")?;
    Ok(Arc::new(queue))
}

#[cfg(not(feature = "postgres"))]
async fn connect_queue(_url: &str, _queue_name: &str) -> anyhow::Result<Arc<dyn WorkQueue>> {
    anyhow::bail!("built without the `postgres` feature, no work queue is available")
}

async fn run(common: &CommonArgs, args: RunArgs) -> anyhow::Result<()> {
    let worker_id = args
        .worker_id
        .unwrap_or_else(WorkerConfig::generate_worker_id);
    let config = WorkerConfig::new(worker_id)
        .with_task_param(args.task_param)
        .with_temp_dir(args.temp_dir)
        .with_gpu(!args.cpu)
        .with_batch_size(args.batch_size as usize)
        .with_poll_interval(Duration::from_secs(args.poll_interval))
        .with_health_file(args.health_file);

    let store = common.store()?;
    let queue = common.queue().await?;
    let processor: Arc<dyn Processor> =
        Arc::new(CommandProcessor::parse(&args.processor_cmd, &config)?);

    let ctx = WorkerContextBuilder::new(config)
        .with_store(store)
        .with_queue(queue)
        .with_processor(processor)
        .build()?;
    ctx.initialize().await?;

    #[cfg(feature = "metrics")]
    shepherd::metrics::init_metrics()?;

    let token = ShutdownToken::new();
    spawn_signal_listener(token.clone());
    let preemption_url = match args.preemption_url {
        Some(url) => Some(url),
        None if args.watch_preemption => Some(SPOT_TERMINATION_URL.to_string()),
        None => None,
    };
    if let Some(url) = preemption_url {
        info!(url = %url, "watching for termination notices");
        spawn_preemption_watch(HttpPreemptionProbe::new(url), PREEMPTION_POLL, token.clone());
    }

    WorkerLoop::new(ctx, token).run().await
}

async fn enqueue(common: &CommonArgs, work_ref: String, task_param: Option<String>) -> anyhow::Result<()> {
    validate_work_ref(&work_ref)?;
    let body = MessageBody::new(work_ref, task_param).to_json()?;
    let queue = common.queue().await?;
    let message_id = queue.send(&body).await?;
    println!("{message_id}");
    Ok(())
}

async fn status(common: &CommonArgs, job_id: String) -> anyhow::Result<()> {
    let store = common.store()?;
    let job_id = JobId::new(job_id);
    match store.reconcile(&job_id).await? {
        Some(job) => {
            println!("{}", serde_json::to_string_pretty(&job.record)?);
            Ok(())
        }
        None => anyhow::bail!("job {job_id} not found"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.common.log_format);

    match args.command {
        Commands::Run(run_args) => run(&args.common, run_args).await,
        Commands::Enqueue { work_ref, task_param } => {
            enqueue(&args.common, work_ref, task_param).await
        }
        Commands::Status { job_id } => status(&args.common, job_id).await,
    }
}
