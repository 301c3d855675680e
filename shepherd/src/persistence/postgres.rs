use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PersistenceConfig;
use crate::queue::{ReceiptHandle, ReceivedMessage, WorkQueue};

/// Longest pause between polls while long-polling for a message.
const POLL_STEP: Duration = Duration::from_millis(500);

/// PostgreSQL-backed work queue.
///
/// Each message row carries a `visible_at` timestamp. Receiving a message
/// pushes `visible_at` forward by the visibility timeout and issues a fresh
/// receipt; deleting by that receipt acknowledges it. Rows are claimed with
/// `FOR UPDATE SKIP LOCKED`, so concurrent consumers never receive the same
/// delivery.
#[derive(Clone, Debug)]
pub struct PostgresWorkQueue {
    pool: PgPool,
    queue_name: String,
}

impl PostgresWorkQueue {
    pub fn new(pool: PgPool, queue_name: impl Into<String>) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
        }
    }

    /// Open a pool with the given settings and create the table if needed.
    pub async fn connect(config: &PersistenceConfig, queue_name: impl Into<String>) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.connection_string)
            .await?;
        let queue = Self::new(pool, queue_name);
        queue.ensure_schema().await?;
        Ok(queue)
    }

    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS shepherd_queue_messages (
                id UUID PRIMARY KEY,
                queue_name TEXT NOT NULL,
                body TEXT NOT NULL,
                receipt UUID,
                receive_count INTEGER NOT NULL DEFAULT 0,
                visible_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS shepherd_queue_messages_ready
                ON shepherd_queue_messages (queue_name, visible_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn try_receive(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> anyhow::Result<Vec<ReceivedMessage>> {
        let rows = sqlx::query(
            r#"
            WITH next AS (
                SELECT id
                FROM shepherd_queue_messages
                WHERE queue_name = $1
                  AND visible_at <= NOW()
                ORDER BY visible_at, created_at
                FOR UPDATE SKIP LOCKED
                LIMIT $2
            )
            UPDATE shepherd_queue_messages m
            SET receipt = gen_random_uuid(),
                receive_count = m.receive_count + 1,
                visible_at = NOW() + ($3::bigint) * INTERVAL '1 millisecond'
            FROM next
            WHERE m.id = next.id
            RETURNING m.id, m.body, m.receipt, m.receive_count
            "#,
        )
        .bind(&self.queue_name)
        .bind(max_messages as i64)
        .bind(visibility_timeout.as_millis() as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row.try_get("id")?;
            let receipt: Uuid = row.try_get("receipt")?;
            let receive_count: i32 = row.try_get("receive_count")?;
            messages.push(ReceivedMessage {
                message_id: id.to_string(),
                handle: ReceiptHandle::new(receipt.to_string()),
                body: row.try_get("body")?,
                receive_count: receive_count.max(0) as u32,
            });
        }
        Ok(messages)
    }
}

#[async_trait]
impl WorkQueue for PostgresWorkQueue {
    async fn receive(
        &self,
        max_messages: usize,
        wait_time: Duration,
        visibility_timeout: Duration,
    ) -> anyhow::Result<Vec<ReceivedMessage>> {
        let deadline = Instant::now() + wait_time;
        loop {
            let messages = self.try_receive(max_messages.max(1), visibility_timeout).await?;
            let now = Instant::now();
            if !messages.is_empty() || now >= deadline {
                debug!(queue = %self.queue_name, received = messages.len(), "receive finished");
                return Ok(messages);
            }
            tokio::time::sleep(POLL_STEP.min(deadline - now)).await;
        }
    }

    async fn delete(&self, handle: &ReceiptHandle) -> anyhow::Result<()> {
        let receipt = Uuid::parse_str(handle.as_str())?;
        let res = sqlx::query(
            r#"
            DELETE FROM shepherd_queue_messages
            WHERE queue_name = $1
              AND receipt = $2
            "#,
        )
        .bind(&self.queue_name)
        .bind(receipt)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            warn!(queue = %self.queue_name, receipt = %handle, "receipt is stale, message was redelivered or already deleted");
        }
        Ok(())
    }

    async fn depth(&self) -> anyhow::Result<u64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*)::bigint AS count
            FROM shepherd_queue_messages
            WHERE queue_name = $1
              AND visible_at <= NOW()
            "#,
        )
        .bind(&self.queue_name)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.try_get("count")?;
        Ok(count.max(0) as u64)
    }

    async fn send(&self, body: &str) -> anyhow::Result<String> {
        let id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO shepherd_queue_messages (id, queue_name, body, receive_count, visible_at, created_at)
            VALUES ($1, $2, $3, 0, NOW(), NOW())
            "#,
        )
        .bind(id)
        .bind(&self.queue_name)
        .bind(body)
        .execute(&self.pool)
        .await?;

        debug!(queue = %self.queue_name, message_id = %id, "message sent");
        Ok(id.to_string())
    }
}
