/// PostgreSQL work queue.
///
/// This module provides `PostgresWorkQueue`, a PostgreSQL-backed
/// implementation of the [`WorkQueue`](crate::queue::WorkQueue) trait.
pub mod postgres;

pub use postgres::PostgresWorkQueue;
