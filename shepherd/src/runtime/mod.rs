/// Builder for the per-worker context.
pub mod builder;
/// Worker heartbeats and health-check file.
pub mod heartbeat;
/// Shutdown token and the signal and preemption sources that cancel it.
pub mod shutdown;
/// The heartbeat, recover, drain and sleep control loop.
pub mod supervisor;
/// Worker configuration.
pub mod worker;

pub use builder::{WorkerContext, WorkerContextBuilder, WorkerError};
pub use heartbeat::{
    touch_health_file, ConfigSnapshot, HeartbeatPublisher, HeartbeatStatus, HostIdentity,
    WorkerHeartbeat, WorkerStats,
};
pub use shutdown::{
    spawn_preemption_watch, spawn_signal_listener, HttpPreemptionProbe, PreemptionProbe,
    ShutdownToken, SPOT_TERMINATION_URL,
};
pub use supervisor::{CycleReport, DrainReport, JobOutcome, MessageDisposition, WorkerLoop};
pub use worker::WorkerConfig;
