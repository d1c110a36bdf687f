//! The durable message bus connecting proxy, planner, and executor.

pub mod message;
pub mod router;
pub mod store;

pub use message::{
    AgentResponse, ApprovalRequestMessage, ApprovalResultMessage, ExecutionRequest,
    ExecutionStatus, MessageKind, MessagePayload, PlanRequest, PlanResult, PlannerGuidance,
    QueueMessage, ReplanRequest, ResearchRequestMessage, ResearchResultMessage, SystemEvent,
    UserMessage,
};
pub use router::Router;
pub use store::{QueueError, QueueStore};

/// Queue names used by the static routing table.
pub mod queues {
    pub const PROXY: &str = "proxy_queue";
    pub const PLANNER: &str = "planner_queue";
    pub const EXECUTOR: &str = "executor_queue";
    pub const RUNTIME: &str = "runtime_queue";
}
