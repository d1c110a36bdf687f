//! Bounded replan cascade.
//!
//! When a work item exhausts its retry attempts and consult-planner
//! guidance, the replan cascade asks the planner for an entirely new
//! strategy — not a retry of the same approach. User escalation is the
//! last resort, so the cascade is bounded: after `MAX_REPLAN_DEPTH`
//! replans the caller must surface the failure.

use serde_json::Value;
use tracing::{info, warn};

use crate::queue::{MessagePayload, QueueMessage, ReplanRequest, Router};

/// Maximum replans for one original work item. The planner gets the
/// original attempt plus this many fresh strategies before the human is
/// pulled in.
pub const MAX_REPLAN_DEPTH: u32 = 2;

/// Triggers replanning through the queue bus.
#[derive(Debug, Clone)]
pub struct ReplanManager {
    router: Router,
}

impl ReplanManager {
    /// Bind to the router.
    pub fn new(router: Router) -> Self {
        Self { router }
    }

    /// Enqueue a replan request with full failure history.
    ///
    /// Returns `true` if a replan was enqueued, `false` if
    /// `current_depth` already reached [`MAX_REPLAN_DEPTH`] — automated
    /// recovery is exhausted and the caller should escalate to the user.
    pub async fn trigger_replan(
        &self,
        work_item_id: &str,
        original_goal: &str,
        failure_history: Vec<Value>,
        trace_id: &str,
        current_depth: u32,
    ) -> Result<bool, crate::queue::store::QueueError> {
        if current_depth >= MAX_REPLAN_DEPTH {
            warn!(
                work_item_id,
                current_depth,
                max = MAX_REPLAN_DEPTH,
                "replan depth exhausted, escalating to user"
            );
            return Ok(false);
        }

        let next_depth = current_depth.saturating_add(1);
        let msg = QueueMessage::with_trace(
            "runtime",
            trace_id,
            MessagePayload::ReplanRequest(ReplanRequest {
                work_item_id: work_item_id.to_owned(),
                original_goal: original_goal.to_owned(),
                failure_history,
                replan_depth: next_depth,
            }),
        );
        self.router.route(msg).await?;
        info!(work_item_id, depth = next_depth, "replan enqueued");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::open_in_memory;
    use crate::queue::{MessageKind, QueueStore};

    async fn fixtures() -> (QueueStore, ReplanManager) {
        let pool = open_in_memory().await.expect("pool");
        let store = QueueStore::new(pool);
        store.initialize().await.expect("initialize");
        let manager = ReplanManager::new(Router::new(store.clone()));
        (store, manager)
    }

    #[tokio::test]
    async fn test_replan_enqueued_with_incremented_depth() {
        let (store, manager) = fixtures().await;
        let triggered = manager
            .trigger_replan("wi-1", "do the thing", vec![], "trace-1", 0)
            .await
            .expect("trigger");
        assert!(triggered);

        let msg = store
            .lease("planner_queue")
            .await
            .expect("lease")
            .expect("replan message");
        assert_eq!(msg.kind(), MessageKind::ReplanRequest);
        match msg.payload {
            MessagePayload::ReplanRequest(replan) => {
                assert_eq!(replan.replan_depth, 1);
                assert_eq!(replan.work_item_id, "wi-1");
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_depth_bound_blocks_replan() {
        let (store, manager) = fixtures().await;
        let triggered = manager
            .trigger_replan("wi-1", "goal", vec![], "trace-1", MAX_REPLAN_DEPTH)
            .await
            .expect("trigger");
        assert!(!triggered, "at max depth the cascade must stop");
        assert_eq!(store.pending_count("planner_queue").await.expect("count"), 0);
    }

    #[tokio::test]
    async fn test_depth_below_bound_allows_final_replan() {
        let (_store, manager) = fixtures().await;
        let triggered = manager
            .trigger_replan("wi-1", "goal", vec![], "trace-1", MAX_REPLAN_DEPTH - 1)
            .await
            .expect("trigger");
        assert!(triggered, "depth max-1 still gets the final replan");
    }
}
