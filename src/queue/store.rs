//! Durable SQLite queue store with lease/ack/retry semantics.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use super::message::{MessageKind, MessagePayload, QueueMessage};

/// Default lease TTL before a message is reclaimable.
const DEFAULT_LEASE_TTL_SECS: i64 = 60;

/// Queue store errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// SQLite failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A payload column failed to (de)serialize.
    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

type MessageRow = (
    String,         // id
    String,         // sender
    String,         // trace_id
    String,         // queue_name
    String,         // payload
    i32,            // urgency
    String,         // created_at
    Option<String>, // leased_at
    i64,            // attempts
);

/// Durable queue store. The only rendezvous point between consumers.
#[derive(Debug, Clone)]
pub struct QueueStore {
    pool: SqlitePool,
    lease_ttl: Duration,
}

impl QueueStore {
    /// Wrap an existing pool with the default lease TTL.
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_lease_ttl(pool, Duration::seconds(DEFAULT_LEASE_TTL_SECS))
    }

    /// Wrap an existing pool with a custom lease TTL.
    pub fn with_lease_ttl(pool: SqlitePool, lease_ttl: Duration) -> Self {
        Self { pool, lease_ttl }
    }

    /// Create the queue table if absent.
    pub async fn initialize(&self) -> Result<(), QueueError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS queue_messages (
                 id TEXT PRIMARY KEY,
                 message_kind TEXT NOT NULL,
                 sender TEXT NOT NULL,
                 trace_id TEXT NOT NULL,
                 queue_name TEXT NOT NULL,
                 payload TEXT NOT NULL,
                 urgency INTEGER NOT NULL DEFAULT 0,
                 created_at TEXT NOT NULL,
                 leased_at TEXT,
                 attempts INTEGER NOT NULL DEFAULT 0
             )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queue_messages_lease
             ON queue_messages (queue_name, leased_at, created_at)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist a message on its queue.
    pub async fn enqueue(&self, msg: &QueueMessage) -> Result<(), QueueError> {
        sqlx::query(
            "INSERT INTO queue_messages
                 (id, message_kind, sender, trace_id, queue_name, payload,
                  urgency, created_at, leased_at, attempts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&msg.id)
        .bind(msg.kind().as_str())
        .bind(&msg.sender)
        .bind(&msg.trace_id)
        .bind(&msg.queue_name)
        .bind(serde_json::to_string(&msg.payload)?)
        .bind(msg.urgency)
        .bind(msg.created_at.to_rfc3339())
        .bind(msg.leased_at.map(|t| t.to_rfc3339()))
        .bind(i64::from(msg.attempts))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Lease the oldest available message on a queue.
    ///
    /// Available = never leased, or lease older than the TTL (reclaimed
    /// from a dead consumer). Leasing stamps `leased_at` and bumps
    /// `attempts`.
    pub async fn lease(&self, queue_name: &str) -> Result<Option<QueueMessage>, QueueError> {
        self.lease_where(queue_name, None, None).await
    }

    /// Lease the oldest available message matching a kind and trace.
    ///
    /// Correlation-filtered leasing: under contention on a shared queue
    /// (runtime_queue carries guidance *and* approval results), a waiter
    /// must only lease its own correlated reply and leave the rest
    /// untouched for their owners.
    pub async fn lease_matching(
        &self,
        queue_name: &str,
        kind: MessageKind,
        trace_id: &str,
    ) -> Result<Option<QueueMessage>, QueueError> {
        self.lease_where(queue_name, Some(kind), Some(trace_id)).await
    }

    async fn lease_where(
        &self,
        queue_name: &str,
        kind: Option<MessageKind>,
        trace_id: Option<&str>,
    ) -> Result<Option<QueueMessage>, QueueError> {
        let cutoff = (Utc::now() - self.lease_ttl).to_rfc3339();

        // Empty filter values match everything, so one statement serves
        // both the plain and the correlation-filtered lease.
        let row: Option<MessageRow> = sqlx::query_as(
            "SELECT id, sender, trace_id, queue_name, payload, urgency,
                    created_at, leased_at, attempts
             FROM queue_messages
             WHERE queue_name = ?1
               AND (leased_at IS NULL OR leased_at < ?2)
               AND (?3 = '' OR message_kind = ?3)
               AND (?4 = '' OR trace_id = ?4)
             ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .bind(queue_name)
        .bind(&cutoff)
        .bind(kind.map_or("", |k| k.as_str()))
        .bind(trace_id.unwrap_or(""))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE queue_messages SET leased_at = ?1, attempts = attempts + 1 WHERE id = ?2",
        )
        .bind(&now)
        .bind(&row.0)
        .execute(&self.pool)
        .await?;

        let mut msg = row_to_message(row)?;
        msg.leased_at = Some(Utc::now());
        msg.attempts = msg.attempts.saturating_add(1);
        Ok(Some(msg))
    }

    /// Delete a message after successful processing.
    pub async fn ack(&self, id: &str) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM queue_messages WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Clear a lease so the message becomes immediately available again.
    pub async fn return_for_retry(&self, id: &str) -> Result<(), QueueError> {
        sqlx::query("UPDATE queue_messages SET leased_at = NULL WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Messages currently persisted on a queue (leased or not).
    pub async fn pending_count(&self, queue_name: &str) -> Result<i64, QueueError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM queue_messages WHERE queue_name = ?1")
                .bind(queue_name)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// All messages on a queue in insertion order, without leasing.
    /// Inspection surface for status displays and tests.
    pub async fn peek_all(&self, queue_name: &str) -> Result<Vec<QueueMessage>, QueueError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, sender, trace_id, queue_name, payload, urgency,
                    created_at, leased_at, attempts
             FROM queue_messages WHERE queue_name = ?1
             ORDER BY created_at ASC, id ASC",
        )
        .bind(queue_name)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_message).collect()
    }
}

fn row_to_message(row: MessageRow) -> Result<QueueMessage, QueueError> {
    let (id, sender, trace_id, queue_name, payload, urgency, created_at, leased_at, attempts) = row;
    let payload: MessagePayload = serde_json::from_str(&payload)?;
    Ok(QueueMessage {
        id,
        sender,
        trace_id,
        queue_name,
        payload,
        urgency,
        created_at: parse_dt(&created_at),
        leased_at: leased_at.as_deref().map(parse_dt),
        attempts: u32::try_from(attempts).unwrap_or(0),
    })
}

fn parse_dt(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
