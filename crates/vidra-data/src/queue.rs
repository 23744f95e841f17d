//! Durable work queues with priorities, per-message TTL, and leases.
//!
//! Delivery uses `FOR UPDATE SKIP LOCKED` so multiple workers can poll the
//! same queue without contending. A message is invisible while its lease
//! (`locked_until`) is in the future; workers acknowledge by deleting the row
//! only after the job record reached a terminal state, so a crashed worker's
//! message is re-delivered once the lease lapses. Expired messages are never
//! delivered.

use std::time::Duration;

use serde_json::Value;
use sqlx::{FromRow, PgPool};

use crate::error::{Result, query};

/// The queues the worker pools consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueName {
    /// Torrent download work.
    Download,
    /// Post-download conversion work.
    Conversion,
}

impl QueueName {
    /// Stable storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Conversion => "conversion",
        }
    }
}

/// A message leased to a worker.
#[derive(Debug, Clone, FromRow)]
pub struct LeasedMessage {
    /// Row id used to acknowledge or extend the lease.
    pub id: i64,
    /// The JSON payload supplied at enqueue time.
    pub payload: Value,
    /// Delivery priority (higher first).
    pub priority: i16,
}

/// Database-backed queue operations.
#[derive(Clone)]
pub struct QueueStore {
    pool: PgPool,
}

impl QueueStore {
    /// Wrap a connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue a message with a priority (1..=10, higher first) and TTL.
    ///
    /// # Errors
    ///
    /// Returns an error when the database operation fails.
    pub async fn enqueue(
        &self,
        queue: QueueName,
        payload: &Value,
        priority: i16,
        ttl: Duration,
    ) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO queue_messages (queue, payload, priority, expires_at)
            VALUES ($1, $2, $3, now() + make_interval(secs => $4))
            RETURNING id
            ",
        )
        .bind(queue.as_str())
        .bind(payload)
        .bind(priority.clamp(1, 10))
        .bind(ttl.as_secs_f64())
        .fetch_one(&self.pool)
        .await
        .map_err(query("queue.enqueue"))?;
        Ok(id)
    }

    /// Lease the next deliverable message, if any. Highest priority first,
    /// FIFO within a priority.
    ///
    /// # Errors
    ///
    /// Returns an error when the database operation fails.
    pub async fn dequeue(
        &self,
        queue: QueueName,
        lease: Duration,
    ) -> Result<Option<LeasedMessage>> {
        let message = sqlx::query_as::<_, LeasedMessage>(
            r"
            UPDATE queue_messages
            SET locked_until = now() + make_interval(secs => $2)
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE queue = $1
                  AND expires_at > now()
                  AND (locked_until IS NULL OR locked_until < now())
                ORDER BY priority DESC, enqueued_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, payload, priority
            ",
        )
        .bind(queue.as_str())
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(query("queue.dequeue"))?;
        Ok(message)
    }

    /// Extend the lease of a message a worker is still processing.
    ///
    /// # Errors
    ///
    /// Returns an error when the database operation fails.
    pub async fn extend_lease(&self, message_id: i64, lease: Duration) -> Result<()> {
        sqlx::query(
            "UPDATE queue_messages SET locked_until = now() + make_interval(secs => $2) WHERE id = $1",
        )
        .bind(message_id)
        .bind(lease.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(query("queue.extend_lease"))?;
        Ok(())
    }

    /// Acknowledge (delete) a processed message.
    ///
    /// # Errors
    ///
    /// Returns an error when the database operation fails.
    pub async fn ack(&self, message_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM queue_messages WHERE id = $1")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(query("queue.ack"))?;
        Ok(())
    }

    /// Discard messages whose TTL lapsed; returns how many were dropped.
    ///
    /// # Errors
    ///
    /// Returns an error when the database operation fails.
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE expires_at <= now()")
            .execute(&self.pool)
            .await
            .map_err(query("queue.purge_expired"))?;
        Ok(result.rows_affected())
    }
}
