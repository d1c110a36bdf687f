//! Agent-requested memory operations and the taint gates around them.
//!
//! Two gates protect long-term memory from prompt injection:
//!
//! - **Retrieval gate** — an external-tainted request must never see
//!   owner-tainted memories; [`filter_for_taint`] strips them before
//!   anything reaches the agent's context.
//! - **Hard write gate** — an external-tainted turn cannot author
//!   memories at all. Raw-lane ingestion of the inbound message itself
//!   (low-reingestion tier) is the only write such turns get.

use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use super::{MemoryError, MemoryItem, MemoryStore, MemoryType, ReingestionTier};
use crate::audit::AuditLog;
use crate::types::TaintLevel;

/// Kind of memory write operation an agent may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryOpKind {
    Store,
    Update,
    Delete,
    Link,
}

impl MemoryOpKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Link => "link",
        }
    }
}

/// One memory operation attached to an agent response.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MemoryOp {
    pub op: MemoryOpKind,
    #[serde(default)]
    pub memory_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub memory_type: Option<MemoryType>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub entity_refs: Vec<String>,
    #[serde(default)]
    pub link_to: Option<String>,
}

/// Strip memories an external-tainted request must not see.
///
/// Owner-tainted items are dropped when the request context is
/// external; everything passes through otherwise.
pub fn filter_for_taint(items: Vec<MemoryItem>, request_taint: TaintLevel) -> Vec<MemoryItem> {
    if request_taint != TaintLevel::External {
        return items;
    }
    items
        .into_iter()
        .filter(|item| item.taint != TaintLevel::Owner)
        .collect()
}

/// Executes agent-requested memory ops behind the write gates.
pub struct MemoryOps<'a> {
    store: &'a MemoryStore,
    audit: &'a AuditLog,
    max_ops_per_turn: usize,
}

impl<'a> MemoryOps<'a> {
    /// Bind the processor to a store and audit log.
    pub fn new(store: &'a MemoryStore, audit: &'a AuditLog, max_ops_per_turn: usize) -> Self {
        Self {
            store,
            audit,
            max_ops_per_turn,
        }
    }

    /// Execute the ops an agent attached to its response.
    ///
    /// Excess ops beyond the per-turn limit are truncated and audited.
    /// With external request taint every op is blocked (and audited) —
    /// nothing with `source_kind = "agent_memory_op"` can be created on
    /// an external-tainted turn. Returns the number executed.
    pub async fn process(
        &self,
        ops: &[MemoryOp],
        request_taint: TaintLevel,
        scope_id: &str,
        session_id: &str,
        turn_number: u64,
    ) -> Result<usize, MemoryError> {
        if ops.is_empty() {
            return Ok(0);
        }

        let allowed = if ops.len() > self.max_ops_per_turn {
            let dropped = ops.len().saturating_sub(self.max_ops_per_turn);
            warn!(requested = ops.len(), allowed = self.max_ops_per_turn, dropped, "truncating memory ops");
            let _ = self
                .audit
                .log(
                    "memory_ops_truncated",
                    json!({
                        "requested": ops.len(),
                        "allowed": self.max_ops_per_turn,
                        "dropped": dropped,
                    }),
                )
                .await;
            &ops[..self.max_ops_per_turn]
        } else {
            ops
        };

        if request_taint == TaintLevel::External {
            let _ = self
                .audit
                .log(
                    "memory_ops_blocked",
                    json!({
                        "reason": "external taint",
                        "op_count": allowed.len(),
                    }),
                )
                .await;
            return Ok(0);
        }

        let mut executed = 0usize;
        for op in allowed {
            match self.execute_one(op, scope_id, session_id, turn_number).await {
                Ok(memory_id) => {
                    executed = executed.saturating_add(1);
                    let _ = self
                        .audit
                        .log(
                            "memory_op_executed",
                            json!({"op": op.op.as_str(), "memory_id": memory_id}),
                        )
                        .await;
                }
                Err(err) => {
                    let _ = self
                        .audit
                        .log(
                            "memory_op_failed",
                            json!({
                                "op": op.op.as_str(),
                                "memory_id": op.memory_id,
                                "error": err.to_string(),
                            }),
                        )
                        .await;
                }
            }
        }
        Ok(executed)
    }

    /// Ingest raw inbound message content into the low-reingestion lane.
    ///
    /// Allowed for any taint — the lane records what was said, tainted
    /// as it arrived, without letting the agent author memories.
    pub async fn ingest_raw(
        &self,
        text: &str,
        taint: TaintLevel,
        scope_id: &str,
        session_id: &str,
        turn_number: u64,
    ) -> Result<String, MemoryError> {
        let mut item = MemoryItem::new(
            format!("raw:{scope_id}:{turn_number}:{}", Uuid::new_v4().simple()),
            text,
            MemoryType::Episode,
            "conversation_raw",
        );
        item.reingestion_tier = ReingestionTier::LowReingestion;
        item.taint = taint;
        item.session_id = Some(session_id.to_owned());
        self.store.store_raw(&item).await
    }

    async fn execute_one(
        &self,
        op: &MemoryOp,
        scope_id: &str,
        session_id: &str,
        turn_number: u64,
    ) -> Result<String, MemoryError> {
        match op.op {
            MemoryOpKind::Store => {
                let content = op
                    .content
                    .as_deref()
                    .ok_or_else(|| MemoryError::InvalidOp("store requires content".to_owned()))?;
                let memory_type = op
                    .memory_type
                    .ok_or_else(|| MemoryError::InvalidOp("store requires memory_type".to_owned()))?;
                let mut item = MemoryItem::new(
                    format!("agent_op:{scope_id}:{turn_number}:{}", Uuid::new_v4().simple()),
                    content,
                    memory_type,
                    "agent_memory_op",
                );
                item.taint = TaintLevel::Owner;
                item.semantic_tags = op.tags.clone();
                item.entity_refs = op.entity_refs.clone();
                item.session_id = Some(session_id.to_owned());
                self.store.store(&item).await
            }
            MemoryOpKind::Update => {
                let memory_id = op
                    .memory_id
                    .as_deref()
                    .ok_or_else(|| MemoryError::InvalidOp("update requires memory_id".to_owned()))?;
                let content = op
                    .content
                    .as_deref()
                    .ok_or_else(|| MemoryError::InvalidOp("update requires content".to_owned()))?;
                self.store.update_content(memory_id, content).await?;
                Ok(memory_id.to_owned())
            }
            MemoryOpKind::Delete => {
                let memory_id = op
                    .memory_id
                    .as_deref()
                    .ok_or_else(|| MemoryError::InvalidOp("delete requires memory_id".to_owned()))?;
                self.store.delete(memory_id).await?;
                Ok(memory_id.to_owned())
            }
            MemoryOpKind::Link => {
                let memory_id = op
                    .memory_id
                    .as_deref()
                    .ok_or_else(|| MemoryError::InvalidOp("link requires memory_id".to_owned()))?;
                let link_to = op
                    .link_to
                    .as_deref()
                    .ok_or_else(|| MemoryError::InvalidOp("link requires link_to".to_owned()))?;
                // The edge is a causal_refs append on the source memory.
                let Some(existing) = self.store.get(memory_id).await? else {
                    return Err(MemoryError::InvalidOp(format!(
                        "link source not found: {memory_id}"
                    )));
                };
                let mut refs = existing.causal_refs;
                refs.push(link_to.to_owned());
                self.store.update_causal_refs(memory_id, &refs).await?;
                Ok(memory_id.to_owned())
            }
        }
    }
}
