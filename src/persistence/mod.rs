//! SQLite pool helpers and the replay-protection nonce store.
//!
//! Every durable store in the kernel (queue, audit, memory, work items,
//! nonces) owns a [`sqlx::SqlitePool`] and creates its own schema in an
//! `initialize()` call. In-memory pools are capped at a single connection
//! so every caller sees the same database.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Open (creating if missing) a SQLite database at `path`.
pub async fn open_pool(path: impl AsRef<Path>) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path.as_ref())
        .create_if_missing(true);
    SqlitePoolOptions::new().connect_with(options).await
}

/// Open an in-memory database for tests.
///
/// Single connection: each SQLite `:memory:` connection is otherwise its
/// own private database.
pub async fn open_in_memory() -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
}

/// SQLite nonce store backing replay protection.
///
/// A nonce is keyed as `{domain}:{nonce}`; the primary-key constraint on
/// `key` makes `record` atomic — two racing writers cannot both insert
/// the same binding.
#[derive(Debug, Clone)]
pub struct NonceStore {
    pool: SqlitePool,
}

impl NonceStore {
    /// Wrap an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the `nonces` table if absent.
    pub async fn initialize(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS nonces (
                 key TEXT PRIMARY KEY,
                 domain TEXT NOT NULL,
                 nonce TEXT NOT NULL,
                 recorded_at TEXT NOT NULL
             )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Whether a nonce has already been consumed in this domain.
    pub async fn is_used(&self, domain: &str, nonce: &str) -> Result<bool, sqlx::Error> {
        let key = format!("{domain}:{nonce}");
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM nonces WHERE key = ?1")
            .bind(&key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Record a nonce. Returns `true` if newly recorded, `false` if the
    /// binding already existed (a replay caught at insert time).
    pub async fn record(&self, domain: &str, nonce: &str) -> Result<bool, sqlx::Error> {
        let key = format!("{domain}:{nonce}");
        let result = sqlx::query(
            "INSERT OR IGNORE INTO nonces (key, domain, nonce, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&key)
        .bind(domain)
        .bind(nonce)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete nonces recorded before `older_than`. Returns the count removed.
    pub async fn prune_expired(&self, older_than: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM nonces WHERE recorded_at < ?1")
            .bind(older_than.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
