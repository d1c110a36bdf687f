//! SQLite + FTS5 memory store.
//!
//! The `memories` row store holds full items; `memories_fts` is a
//! contentless-sync FTS5 index over `content`, kept current by triggers.
//! The raw lane (`store_raw`/`search_raw`) is the low-reingestion tier
//! that external-tainted turns may still feed.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::{MemoryError, MemoryItem, MemoryType, ReingestionTier, TrustLevel};
use crate::types::TaintLevel;

/// Raw row shape returned by memory queries.
type MemoryRow = (
    String,         // memory_id
    String,         // content
    String,         // memory_type
    String,         // reingestion_tier
    String,         // trust_level
    String,         // taint
    String,         // created_at
    String,         // updated_at
    i64,            // access_count
    Option<String>, // last_accessed
    String,         // semantic_tags
    String,         // entity_refs
    String,         // causal_refs
    Option<String>, // session_id
    String,         // source_kind
);

const SELECT_COLUMNS: &str = "m.memory_id, m.content, m.memory_type, m.reingestion_tier, \
     m.trust_level, m.taint, m.created_at, m.updated_at, m.access_count, m.last_accessed, \
     m.semantic_tags, m.entity_refs, m.causal_refs, m.session_id, m.source_kind";

/// SQLite-backed memory store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    pool: SqlitePool,
}

impl MemoryStore {
    /// Wrap an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the memory tables, FTS index, and sync triggers if absent.
    pub async fn initialize(&self) -> Result<(), MemoryError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS memories (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 memory_id TEXT NOT NULL UNIQUE,
                 content TEXT NOT NULL,
                 memory_type TEXT NOT NULL,
                 reingestion_tier TEXT NOT NULL,
                 trust_level TEXT NOT NULL,
                 taint TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL,
                 access_count INTEGER NOT NULL DEFAULT 0,
                 last_accessed TEXT,
                 semantic_tags TEXT NOT NULL,
                 entity_refs TEXT NOT NULL,
                 causal_refs TEXT NOT NULL,
                 session_id TEXT,
                 source_kind TEXT NOT NULL
             )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts
             USING fts5(content, content='memories', content_rowid='id')",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
                 INSERT INTO memories_fts(rowid, content) VALUES (new.id, new.content);
             END",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
                 INSERT INTO memories_fts(memories_fts, rowid, content)
                 VALUES ('delete', old.id, old.content);
             END",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TRIGGER IF NOT EXISTS memories_au AFTER UPDATE ON memories BEGIN
                 INSERT INTO memories_fts(memories_fts, rowid, content)
                 VALUES ('delete', old.id, old.content);
                 INSERT INTO memories_fts(rowid, content) VALUES (new.id, new.content);
             END",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert or replace a memory. Returns its id.
    pub async fn store(&self, item: &MemoryItem) -> Result<String, MemoryError> {
        sqlx::query(
            "INSERT INTO memories (
                 memory_id, content, memory_type, reingestion_tier, trust_level,
                 taint, created_at, updated_at, access_count, last_accessed,
                 semantic_tags, entity_refs, causal_refs, session_id, source_kind
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(memory_id) DO UPDATE SET
                 content = excluded.content,
                 memory_type = excluded.memory_type,
                 reingestion_tier = excluded.reingestion_tier,
                 trust_level = excluded.trust_level,
                 taint = excluded.taint,
                 created_at = excluded.created_at,
                 updated_at = excluded.updated_at,
                 access_count = excluded.access_count,
                 last_accessed = excluded.last_accessed,
                 semantic_tags = excluded.semantic_tags,
                 entity_refs = excluded.entity_refs,
                 causal_refs = excluded.causal_refs,
                 session_id = excluded.session_id,
                 source_kind = excluded.source_kind",
        )
        .bind(&item.memory_id)
        .bind(&item.content)
        .bind(item.memory_type.as_str())
        .bind(item.reingestion_tier.as_str())
        .bind(item.trust_level.as_str())
        .bind(item.taint.as_str())
        .bind(item.created_at.to_rfc3339())
        .bind(item.updated_at.to_rfc3339())
        .bind(i64::from(item.access_count))
        .bind(item.last_accessed.map(|t| t.to_rfc3339()))
        .bind(serde_json::to_string(&item.semantic_tags)?)
        .bind(serde_json::to_string(&item.entity_refs)?)
        .bind(serde_json::to_string(&item.causal_refs)?)
        .bind(item.session_id.as_deref())
        .bind(&item.source_kind)
        .execute(&self.pool)
        .await?;
        Ok(item.memory_id.clone())
    }

    /// Fetch a memory by id.
    pub async fn get(&self, memory_id: &str) -> Result<Option<MemoryItem>, MemoryError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM memories m WHERE m.memory_id = ?1");
        let row: Option<MemoryRow> = sqlx::query_as(&sql)
            .bind(memory_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_item).transpose()
    }

    /// Replace a memory's content, stamping `updated_at`.
    pub async fn update_content(
        &self,
        memory_id: &str,
        content: &str,
    ) -> Result<(), MemoryError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE memories SET content = ?1, updated_at = ?2 WHERE memory_id = ?3")
            .bind(content)
            .bind(&now)
            .bind(memory_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Replace a memory's causal references, stamping `updated_at`.
    pub async fn update_causal_refs(
        &self,
        memory_id: &str,
        causal_refs: &[String],
    ) -> Result<(), MemoryError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE memories SET causal_refs = ?1, updated_at = ?2 WHERE memory_id = ?3")
            .bind(serde_json::to_string(causal_refs)?)
            .bind(&now)
            .bind(memory_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a memory by id.
    pub async fn delete(&self, memory_id: &str) -> Result<(), MemoryError> {
        sqlx::query("DELETE FROM memories WHERE memory_id = ?1")
            .bind(memory_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Full-text search, optionally narrowed to a session.
    pub async fn search_keyword(
        &self,
        query: &str,
        limit: usize,
        session_id: Option<&str>,
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        let sanitised = sanitise_fts_query(query);
        if sanitised.is_empty() {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows: Vec<MemoryRow> = if let Some(session) = session_id {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM memories_fts
                 JOIN memories m ON memories_fts.rowid = m.id
                 WHERE memories_fts MATCH ?1 AND m.session_id = ?2
                 ORDER BY memories_fts.rank LIMIT ?3"
            );
            sqlx::query_as(&sql)
                .bind(&sanitised)
                .bind(session)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
        } else {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM memories_fts
                 JOIN memories m ON memories_fts.rowid = m.id
                 WHERE memories_fts MATCH ?1
                 ORDER BY memories_fts.rank LIMIT ?2"
            );
            sqlx::query_as(&sql)
                .bind(&sanitised)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
        };
        rows.into_iter().map(row_to_item).collect()
    }

    /// List memories of a type, newest first.
    pub async fn search_by_type(
        &self,
        memory_type: MemoryType,
        limit: usize,
        session_id: Option<&str>,
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<MemoryRow> = if let Some(session) = session_id {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM memories m
                 WHERE m.memory_type = ?1 AND m.session_id = ?2
                 ORDER BY m.updated_at DESC, m.created_at DESC, m.memory_id ASC
                 LIMIT ?3"
            );
            sqlx::query_as(&sql)
                .bind(memory_type.as_str())
                .bind(session)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
        } else {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM memories m
                 WHERE m.memory_type = ?1
                 ORDER BY m.updated_at DESC, m.created_at DESC, m.memory_id ASC
                 LIMIT ?2"
            );
            sqlx::query_as(&sql)
                .bind(memory_type.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
        };
        rows.into_iter().map(row_to_item).collect()
    }

    /// Most recently updated memories.
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<MemoryItem>, MemoryError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM memories m
             ORDER BY m.updated_at DESC, m.created_at DESC, m.memory_id ASC
             LIMIT ?1"
        );
        let rows: Vec<MemoryRow> = sqlx::query_as(&sql).bind(limit).fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_item).collect()
    }

    /// Bump access bookkeeping on retrieval.
    pub async fn increment_access(&self, memory_id: &str) -> Result<(), MemoryError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE memories
             SET access_count = access_count + 1, last_accessed = ?1, updated_at = ?1
             WHERE memory_id = ?2",
        )
        .bind(&now)
        .bind(memory_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All memories of a session, newest first.
    pub async fn search_session(&self, session_id: &str) -> Result<Vec<MemoryItem>, MemoryError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM memories m
             WHERE m.session_id = ?1
             ORDER BY m.updated_at DESC, m.created_at DESC, m.memory_id ASC"
        );
        let rows: Vec<MemoryRow> = sqlx::query_as(&sql)
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_item).collect()
    }

    /// Raw-lane ingestion. Same table; the tier marks the lane.
    pub async fn store_raw(&self, item: &MemoryItem) -> Result<String, MemoryError> {
        self.store(item).await
    }

    /// Full-text search restricted to the low-reingestion lane.
    pub async fn search_raw(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        let sanitised = sanitise_fts_query(query);
        if sanitised.is_empty() {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM memories_fts
             JOIN memories m ON memories_fts.rowid = m.id
             WHERE memories_fts MATCH ?1 AND m.reingestion_tier = 'low_reingestion'
             ORDER BY memories_fts.rank LIMIT ?2"
        );
        let rows: Vec<MemoryRow> = sqlx::query_as(&sql)
            .bind(&sanitised)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_item).collect()
    }
}

/// Sanitise a user query string for FTS5 MATCH syntax.
///
/// FTS5 treats certain characters and keywords as operators; strip them
/// to avoid syntax errors while preserving search intent. Remaining
/// tokens are joined with spaces (implicit AND).
fn sanitise_fts_query(query: &str) -> String {
    const FTS_KEYWORDS: &[&str] = &["OR", "NOT", "AND", "NEAR"];

    let cleaned: String = query
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == ' ' || c == '_' {
                c
            } else {
                ' '
            }
        })
        .collect();

    cleaned
        .split_whitespace()
        .filter(|t| !FTS_KEYWORDS.contains(t))
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_dt(value: &str) -> Result<DateTime<Utc>, MemoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| MemoryError::InvalidEnum {
            field: "timestamp",
            value: value.to_owned(),
        })
}

fn row_to_item(row: MemoryRow) -> Result<MemoryItem, MemoryError> {
    let (
        memory_id,
        content,
        memory_type,
        reingestion_tier,
        trust_level,
        taint,
        created_at,
        updated_at,
        access_count,
        last_accessed,
        semantic_tags,
        entity_refs,
        causal_refs,
        session_id,
        source_kind,
    ) = row;

    Ok(MemoryItem {
        memory_id,
        content,
        memory_type: MemoryType::parse(&memory_type)?,
        reingestion_tier: ReingestionTier::parse(&reingestion_tier)?,
        trust_level: TrustLevel::parse(&trust_level)?,
        taint: taint
            .parse::<TaintLevel>()
            .map_err(|_| MemoryError::InvalidEnum {
                field: "taint",
                value: taint,
            })?,
        created_at: parse_dt(&created_at)?,
        updated_at: parse_dt(&updated_at)?,
        access_count: u32::try_from(access_count).unwrap_or(0),
        last_accessed: last_accessed.as_deref().map(parse_dt).transpose()?,
        semantic_tags: serde_json::from_str(&semantic_tags)?,
        entity_refs: serde_json::from_str(&entity_refs)?,
        causal_refs: serde_json::from_str(&causal_refs)?,
        session_id,
        embedding: None,
        source_kind,
    })
}
