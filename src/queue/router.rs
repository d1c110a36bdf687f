//! Static routing table for the runtime bus.
//!
//! The router is the single source of truth for where each message kind
//! goes; consumers never hard-code queue names. The topology is fixed by
//! the architecture — dynamic routing would add complexity without
//! benefit — and unknown kinds are unrepresentable: the payload enum
//! rejects them at deserialization and the match below is exhaustive.

use super::message::{MessageKind, QueueMessage};
use super::queues;
use super::store::{QueueError, QueueStore};

/// Destination queue for a message kind.
pub fn route_for(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::PlanRequest | MessageKind::ReplanRequest | MessageKind::ResearchResult => {
            queues::PLANNER
        }
        MessageKind::PlanResult
        | MessageKind::ExecutionStatus
        | MessageKind::ApprovalRequest
        | MessageKind::UserMessage
        | MessageKind::AgentResponse
        | MessageKind::SystemEvent => queues::PROXY,
        MessageKind::ExecutionRequest | MessageKind::ResearchRequest => queues::EXECUTOR,
        MessageKind::PlannerGuidance | MessageKind::ApprovalResult => queues::RUNTIME,
    }
}

/// Thin routing layer over the queue store.
#[derive(Debug, Clone)]
pub struct Router {
    store: QueueStore,
}

impl Router {
    /// Bind the router to a store.
    pub fn new(store: QueueStore) -> Self {
        Self { store }
    }

    /// Set `queue_name` from the routing table, then enqueue.
    pub async fn route(&self, mut msg: QueueMessage) -> Result<(), QueueError> {
        msg.queue_name = route_for(msg.kind()).to_owned();
        self.store.enqueue(&msg).await
    }

    /// Propagate an existing trace id for cross-hop correlation, then route.
    pub async fn route_with_trace(
        &self,
        mut msg: QueueMessage,
        trace_id: &str,
    ) -> Result<(), QueueError> {
        msg.trace_id = trace_id.to_owned();
        self.route(msg).await
    }

    /// The underlying store.
    pub fn store(&self) -> &QueueStore {
        &self.store
    }
}
