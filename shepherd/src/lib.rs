//! Shepherd - lease-based job tracking for queue-fed workers.
//!
//! Ingests work items from an at-least-once message queue and processes
//! each one exactly-once-in-effect despite worker crashes.
//!
//! # Core Concepts
//!
//! - **Job store**: [`JobStore`] keeps JSON job records on an object store,
//!   partitioned by status. Moves between partitions are fenced by a
//!   conditional write and ordered write-new-then-delete-old, so a crash
//!   leaves a duplicate rather than losing the record.
//!
//! - **Leases**: [`LeaseManager`] claims, renews, completes and fails jobs.
//!   Ownership lives in the record itself (`lock_owner`/`lock_until`).
//!
//! - **Recovery**: [`AbandonedJobRecovery`] requeues jobs whose lease
//!   expired, failing them once the [`RetryPolicy`] budget is spent. Every
//!   worker sweeps independently; conditional moves keep concurrent sweeps
//!   from double-reclaiming.
//!
//! - **Queue**: the [`WorkQueue`] trait abstracts the message source.
//!   Messages are always acknowledged after handling; retries go through
//!   the lease path only.
//!
//! - **Runtime**: [`WorkerLoop`](runtime::WorkerLoop) runs heartbeat,
//!   recovery, drain and sleep until its
//!   [`ShutdownToken`](runtime::ShutdownToken) is cancelled.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL work queue via sqlx (default)
//! - `metrics` - Prometheus metrics support

/// Injectable time source.
pub mod clock;

/// Object store and connection pool configuration.
///
/// [`StoreConfig`] builds the object store from an `s3://` or `memory://`
/// URL; [`PersistenceConfig`] sizes the PostgreSQL pool.
pub mod config;

/// Job records and queue message bodies.
///
/// - [`JobRecord`] - the durable record of one unit of work
/// - [`JobStatus`] - the four status partitions
/// - [`WorkKey`] - idempotency key derived from a work reference
/// - [`MessageBody`] - JSON body of a queue message
pub mod job;

/// Lease transitions and the retry policy.
///
/// - [`RetryPolicy`] - max attempts and lease duration
/// - [`LeaseManager`] - start, renew, complete and fail
/// - [`TransitionOutcome`] - applied, not found or superseded
pub mod lease;

/// Prometheus metrics, behind the `metrics` feature.
pub mod metrics;

/// The processor seam and its progress callback.
pub mod processor;

/// The work queue seam.
pub mod queue;

/// Abandoned-job recovery sweep.
pub mod recovery;

/// Status-partitioned job store over an object store.
pub mod store;

/// Tracing spans and lifecycle event helpers.
pub mod telemetry;

#[cfg(feature = "postgres")]
/// PostgreSQL work queue implementation.
///
/// Provides [`PostgresWorkQueue`](persistence::PostgresWorkQueue) when the
/// `postgres` feature is enabled.
pub mod persistence;

/// Worker runtime: context, control loop, heartbeats and shutdown.
pub mod runtime;

pub use clock::*;
pub use config::*;
pub use job::*;
pub use lease::*;
pub use processor::*;
pub use queue::*;
pub use recovery::*;
pub use store::*;
