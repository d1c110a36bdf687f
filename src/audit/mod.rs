//! Hash-chained append-only audit log with checkpoint verification.
//!
//! Each entry's hash covers `(entry_id, event, data, timestamp,
//! prev_hash)` in canonical JSON; the first entry links to `"genesis"`.
//! Tampering with any persisted field breaks recomputation from that
//! entry forward. `log()` serializes writers through an internal lock so
//! the chain head is read and extended atomically.

use chrono::Utc;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::canonical::{sha256_hex, to_canonical_string};

/// Sentinel `prev_hash` for the first chain entry.
const GENESIS: &str = "genesis";

/// Sentinel for a checkpoint written against an empty log.
const EMPTY: &str = "empty";

/// Audit subsystem errors.
#[derive(Debug, Error)]
pub enum AuditError {
    /// SQLite failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// The persisted chain failed verification at startup.
    #[error("audit chain integrity failure")]
    ChainBroken,
}

/// One persisted audit row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditEntry {
    pub entry_id: String,
    pub event: String,
    pub data: String,
    pub timestamp: String,
    pub prev_hash: String,
    pub entry_hash: String,
}

/// Hash-chained SQLite audit log.
#[derive(Debug)]
pub struct AuditLog {
    pool: SqlitePool,
    // Guards the read-head-then-insert sequence in log().
    write_lock: Mutex<()>,
}

impl AuditLog {
    /// Wrap an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    /// Create the audit tables if absent.
    pub async fn initialize(&self) -> Result<(), AuditError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS audit_log (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 entry_id TEXT NOT NULL UNIQUE,
                 event TEXT NOT NULL,
                 data TEXT NOT NULL,
                 timestamp TEXT NOT NULL,
                 prev_hash TEXT NOT NULL,
                 entry_hash TEXT NOT NULL
             )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS audit_checkpoints (
                 checkpoint_id TEXT PRIMARY KEY,
                 entry_id TEXT NOT NULL,
                 entry_hash TEXT NOT NULL,
                 created_at TEXT NOT NULL
             )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append an event to the chain. Returns the new entry id.
    ///
    /// `data` must be a JSON object; it is stored as canonical JSON so
    /// verification recomputes identical bytes.
    pub async fn log(&self, event: &str, data: Value) -> Result<String, AuditError> {
        let _guard = self.write_lock.lock().await;

        let entry_id = Uuid::new_v4().simple().to_string();
        let timestamp = Utc::now().to_rfc3339();
        let data_json = to_canonical_string(&data);

        let head: Option<(String,)> =
            sqlx::query_as("SELECT entry_hash FROM audit_log ORDER BY id DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        let prev_hash = head.map_or_else(|| GENESIS.to_owned(), |(h,)| h);

        let entry_hash = compute_entry_hash(&entry_id, event, &data_json, &timestamp, &prev_hash);

        sqlx::query(
            "INSERT INTO audit_log (entry_id, event, data, timestamp, prev_hash, entry_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&entry_id)
        .bind(event)
        .bind(&data_json)
        .bind(&timestamp)
        .bind(&prev_hash)
        .bind(&entry_hash)
        .execute(&self.pool)
        .await?;

        Ok(entry_id)
    }

    /// Walk the full chain, verifying linkage and recomputing each hash.
    ///
    /// Returns `(true, n)` for an intact chain of `n` entries, or
    /// `(false, 0)` on the first mismatch.
    pub async fn verify_chain(&self) -> Result<(bool, usize), AuditError> {
        let rows: Vec<AuditEntry> = sqlx::query_as(
            "SELECT entry_id, event, data, timestamp, prev_hash, entry_hash
             FROM audit_log ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(verify_rows(&rows, GENESIS))
    }

    /// Record a checkpoint at the current chain head.
    pub async fn write_checkpoint(&self) -> Result<String, AuditError> {
        let checkpoint_id = Uuid::new_v4().simple().to_string();
        let head: Option<(String, String)> =
            sqlx::query_as("SELECT entry_id, entry_hash FROM audit_log ORDER BY id DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        let (entry_id, entry_hash) =
            head.unwrap_or_else(|| (EMPTY.to_owned(), EMPTY.to_owned()));

        sqlx::query(
            "INSERT INTO audit_checkpoints (checkpoint_id, entry_id, entry_hash, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&checkpoint_id)
        .bind(&entry_id)
        .bind(&entry_hash)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(checkpoint_id)
    }

    /// Verify the chain from a checkpoint forward.
    ///
    /// With no checkpoint id the latest checkpoint is used; with no
    /// checkpoints at all (or one written at `"empty"`) this degrades to
    /// a full [`verify_chain`](Self::verify_chain). The first verified
    /// entry's stored hash must equal the checkpoint's recorded hash —
    /// entries before the checkpoint are outside the verified window.
    pub async fn verify_from_checkpoint(
        &self,
        checkpoint_id: Option<&str>,
    ) -> Result<(bool, usize), AuditError> {
        let checkpoint: Option<(String, String)> = match checkpoint_id {
            Some(id) => {
                sqlx::query_as(
                    "SELECT entry_id, entry_hash FROM audit_checkpoints WHERE checkpoint_id = ?1",
                )
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT entry_id, entry_hash FROM audit_checkpoints
                     ORDER BY created_at DESC LIMIT 1",
                )
                .fetch_optional(&self.pool)
                .await?
            }
        };

        let Some((cp_entry_id, cp_entry_hash)) = checkpoint else {
            return self.verify_chain().await;
        };
        if cp_entry_hash == EMPTY {
            return self.verify_chain().await;
        }

        let cp_row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM audit_log WHERE entry_id = ?1")
                .bind(&cp_entry_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some((cp_row_id,)) = cp_row else {
            return Ok((false, 0));
        };

        let rows: Vec<AuditEntry> = sqlx::query_as(
            "SELECT entry_id, event, data, timestamp, prev_hash, entry_hash
             FROM audit_log WHERE id >= ?1 ORDER BY id ASC",
        )
        .bind(cp_row_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok((true, 0));
        }
        if rows[0].entry_hash != cp_entry_hash {
            return Ok((false, 0));
        }
        Ok(verify_rows(&rows, &rows[0].prev_hash))
    }

    /// Refuse startup on a broken chain.
    pub async fn assert_intact(&self) -> Result<usize, AuditError> {
        let (ok, count) = self.verify_chain().await?;
        if !ok {
            return Err(AuditError::ChainBroken);
        }
        Ok(count)
    }

    /// Number of entries currently in the log.
    pub async fn entry_count(&self) -> Result<i64, AuditError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Canonical hash of one entry's persisted fields.
fn compute_entry_hash(
    entry_id: &str,
    event: &str,
    data_json: &str,
    timestamp: &str,
    prev_hash: &str,
) -> String {
    let canonical = to_canonical_string(&json!({
        "entry_id": entry_id,
        "event": event,
        "data": data_json,
        "timestamp": timestamp,
        "prev_hash": prev_hash,
    }));
    sha256_hex(canonical.as_bytes())
}

/// Verify linkage and hashes of an ordered slice of rows.
fn verify_rows(rows: &[AuditEntry], first_prev: &str) -> (bool, usize) {
    let mut expected_prev = first_prev.to_owned();
    for row in rows {
        if row.prev_hash != expected_prev {
            return (false, 0);
        }
        let computed =
            compute_entry_hash(&row.entry_id, &row.event, &row.data, &row.timestamp, &row.prev_hash);
        if computed != row.entry_hash {
            return (false, 0);
        }
        expected_prev = row.entry_hash.clone();
    }
    (true, rows.len())
}
