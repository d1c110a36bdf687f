//! SQLite work-item persistence.
//!
//! Simple scalar columns for the fields queries filter on; everything
//! structured (budget, checks, gates, the attached token) is stored as
//! JSON text and rehydrated through serde.

use sqlx::SqlitePool;

use super::item::{BudgetUsed, WorkError, WorkItem, WorkItemStatus};

type WorkItemRow = (String,);

/// SQLite-backed work-item store.
#[derive(Debug, Clone)]
pub struct WorkItemStore {
    pool: SqlitePool,
}

impl WorkItemStore {
    /// Wrap an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the work-item table if absent.
    pub async fn initialize(&self) -> Result<(), WorkError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS work_items (
                 id TEXT PRIMARY KEY,
                 parent TEXT,
                 status TEXT NOT NULL,
                 item_json TEXT NOT NULL
             )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_work_items_parent ON work_items (parent)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_work_items_status ON work_items (status)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert or replace a work item.
    pub async fn save(&self, item: &WorkItem) -> Result<(), WorkError> {
        sqlx::query(
            "INSERT INTO work_items (id, parent, status, item_json)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 parent = excluded.parent,
                 status = excluded.status,
                 item_json = excluded.item_json",
        )
        .bind(&item.id)
        .bind(item.parent.as_deref())
        .bind(item.status.as_str())
        .bind(serde_json::to_string(item)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch a work item by id.
    pub async fn get(&self, work_item_id: &str) -> Result<Option<WorkItem>, WorkError> {
        let row: Option<WorkItemRow> =
            sqlx::query_as("SELECT item_json FROM work_items WHERE id = ?1")
                .bind(work_item_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(json,)| serde_json::from_str(&json).map_err(WorkError::from))
            .transpose()
    }

    /// All work items with a status.
    pub async fn list_by_status(
        &self,
        status: WorkItemStatus,
    ) -> Result<Vec<WorkItem>, WorkError> {
        let rows: Vec<WorkItemRow> =
            sqlx::query_as("SELECT item_json FROM work_items WHERE status = ?1 ORDER BY id ASC")
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(json,)| serde_json::from_str(&json).map_err(WorkError::from))
            .collect()
    }

    /// All children of a parent.
    pub async fn list_by_parent(&self, parent_id: &str) -> Result<Vec<WorkItem>, WorkError> {
        let rows: Vec<WorkItemRow> =
            sqlx::query_as("SELECT item_json FROM work_items WHERE parent = ?1 ORDER BY id ASC")
                .bind(parent_id)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(json,)| serde_json::from_str(&json).map_err(WorkError::from))
            .collect()
    }

    /// Update execution state (status, attempts, budget) in place.
    pub async fn update_status(
        &self,
        work_item_id: &str,
        status: WorkItemStatus,
        attempts: u32,
        budget_used: &BudgetUsed,
    ) -> Result<(), WorkError> {
        let Some(mut item) = self.get(work_item_id).await? else {
            return Ok(());
        };
        item.status = status;
        item.attempts = attempts;
        item.budget_used = budget_used.clone();
        self.save(&item).await
    }
}
