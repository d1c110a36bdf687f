//! Consult-planner flow for stuck executors.
//!
//! A consult is a plan request flagged `consult: true` carrying the
//! full failure context. The planner answers with `planner_guidance` on
//! the runtime queue; the waiting executor leases only the reply
//! correlated to its own trace id, so concurrent consults and other
//! runtime traffic never steal each other's messages.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::queue::{
    MessageKind, MessagePayload, PlanRequest, QueueError, QueueMessage, QueueStore, Router,
};

/// Default guidance wait.
const DEFAULT_TIMEOUT_SECS: u64 = 90;

/// Poll interval while waiting for guidance.
const POLL_INTERVAL_MS: u64 = 100;

/// Dispatches consult requests and awaits correlated guidance.
#[derive(Debug, Clone)]
pub struct ConsultManager {
    store: QueueStore,
    router: Router,
    timeout: Duration,
}

impl ConsultManager {
    /// Bind to the bus with the default 90-second guidance wait.
    pub fn new(store: QueueStore, router: Router) -> Self {
        Self::with_timeout(store, router, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Bind to the bus with an explicit guidance wait.
    pub fn with_timeout(store: QueueStore, router: Router, timeout: Duration) -> Self {
        Self {
            store,
            router,
            timeout,
        }
    }

    /// Ask the planner for guidance on a stuck work item.
    ///
    /// Blocks until guidance correlated to `trace_id` arrives on the
    /// runtime queue, or the timeout elapses (`None`).
    pub async fn consult(
        &self,
        work_item_id: &str,
        original_goal: &str,
        failure_context: &str,
        trace_id: &str,
    ) -> Result<Option<String>, QueueError> {
        let request = QueueMessage::with_trace(
            "executor",
            trace_id,
            MessagePayload::PlanRequest(PlanRequest {
                text: original_goal.to_owned(),
                scope_id: None,
                consult: true,
                work_item_id: Some(work_item_id.to_owned()),
                failure_context: Some(failure_context.to_owned()),
            }),
        );
        self.router.route(request).await?;
        info!(work_item_id, trace_id, "consult dispatched to planner");

        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            if let Some(msg) = self
                .store
                .lease_matching(
                    crate::queue::queues::RUNTIME,
                    MessageKind::PlannerGuidance,
                    trace_id,
                )
                .await?
            {
                self.store.ack(&msg.id).await?;
                if let MessagePayload::PlannerGuidance(guidance) = msg.payload {
                    debug!(work_item_id, "consult guidance received");
                    return Ok(Some(guidance.guidance));
                }
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(work_item_id, trace_id, "consult timed out without guidance");
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::open_in_memory;
    use crate::queue::PlannerGuidance;

    async fn fixtures(timeout: Duration) -> (QueueStore, ConsultManager) {
        let pool = open_in_memory().await.expect("pool");
        let store = QueueStore::new(pool);
        store.initialize().await.expect("initialize");
        let manager =
            ConsultManager::with_timeout(store.clone(), Router::new(store.clone()), timeout);
        (store, manager)
    }

    #[tokio::test]
    async fn test_consult_receives_planted_guidance() {
        let (store, manager) = fixtures(Duration::from_secs(5)).await;

        // Pre-plant the planner's reply on the runtime queue.
        let mut guidance = QueueMessage::with_trace(
            "planner",
            "trace-1",
            MessagePayload::PlannerGuidance(PlannerGuidance {
                work_item_id: "wi-1".to_owned(),
                guidance: "Try using a different approach.".to_owned(),
            }),
        );
        guidance.queue_name = "runtime_queue".to_owned();
        store.enqueue(&guidance).await.expect("enqueue");

        let received = manager
            .consult("wi-1", "do the thing", "attempt 3 failed", "trace-1")
            .await
            .expect("consult");
        assert_eq!(received.as_deref(), Some("Try using a different approach."));

        // The consult request itself landed on the planner queue.
        let request = store
            .lease("planner_queue")
            .await
            .expect("lease")
            .expect("consult request");
        match request.payload {
            MessagePayload::PlanRequest(plan) => {
                assert!(plan.consult);
                assert_eq!(plan.work_item_id.as_deref(), Some("wi-1"));
                assert_eq!(plan.failure_context.as_deref(), Some("attempt 3 failed"));
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_consult_times_out_without_guidance() {
        let (_store, manager) = fixtures(Duration::from_millis(150)).await;
        let received = manager
            .consult("wi-1", "goal", "failed", "trace-2")
            .await
            .expect("consult");
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_consult_ignores_other_traces() {
        let (store, manager) = fixtures(Duration::from_millis(200)).await;

        let mut foreign = QueueMessage::with_trace(
            "planner",
            "someone-else",
            MessagePayload::PlannerGuidance(PlannerGuidance {
                work_item_id: "wi-9".to_owned(),
                guidance: "not for you".to_owned(),
            }),
        );
        foreign.queue_name = "runtime_queue".to_owned();
        store.enqueue(&foreign).await.expect("enqueue");

        let received = manager
            .consult("wi-1", "goal", "failed", "trace-3")
            .await
            .expect("consult");
        assert!(received.is_none());
        // The foreign guidance is still there for its owner.
        assert_eq!(store.pending_count("runtime_queue").await.expect("count"), 1);
    }
}
