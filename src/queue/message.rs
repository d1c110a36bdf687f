//! Queue message envelope and typed payloads.
//!
//! Every message kind has its own payload struct under a tagged enum —
//! an unknown kind fails deserialization instead of flowing through as
//! an untyped blob, and the router's match is exhaustive by
//! construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::approval::{ApprovalScope, ApprovalVerdict};
use crate::types::TaintLevel;
use crate::work::{WorkItem, WorkItemStatus};

/// Message kind discriminator (mirrors the payload variants).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    PlanRequest,
    ReplanRequest,
    PlanResult,
    ExecutionRequest,
    ExecutionStatus,
    ResearchRequest,
    ResearchResult,
    PlannerGuidance,
    ApprovalRequest,
    ApprovalResult,
    UserMessage,
    AgentResponse,
    SystemEvent,
}

impl MessageKind {
    /// String form stored in the `message_kind` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlanRequest => "plan_request",
            Self::ReplanRequest => "replan_request",
            Self::PlanResult => "plan_result",
            Self::ExecutionRequest => "execution_request",
            Self::ExecutionStatus => "execution_status",
            Self::ResearchRequest => "research_request",
            Self::ResearchResult => "research_result",
            Self::PlannerGuidance => "planner_guidance",
            Self::ApprovalRequest => "approval_request",
            Self::ApprovalResult => "approval_result",
            Self::UserMessage => "user_message",
            Self::AgentResponse => "agent_response",
            Self::SystemEvent => "system_event",
        }
    }
}

/// Ask the planner for a plan. `consult` marks a stuck-executor
/// guidance request rather than a fresh planning cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub text: String,
    #[serde(default)]
    pub scope_id: Option<String>,
    #[serde(default)]
    pub consult: bool,
    #[serde(default)]
    pub work_item_id: Option<String>,
    #[serde(default)]
    pub failure_context: Option<String>,
}

/// Ask the planner for a new strategy after execution failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplanRequest {
    pub work_item_id: String,
    pub original_goal: String,
    #[serde(default)]
    pub failure_history: Vec<Value>,
    pub replan_depth: u32,
}

/// A finished plan as markdown with YAML front matter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanResult {
    pub plan_markdown: String,
    #[serde(default)]
    pub scope_id: Option<String>,
    #[serde(default)]
    pub replan_depth: u32,
}

/// An approved work item ready for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub work_item: WorkItem,
    #[serde(default)]
    pub scope_id: Option<String>,
    #[serde(default)]
    pub replan_depth: u32,
}

/// Terminal (or escalated) execution outcome surfaced to the proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub work_item_id: String,
    pub status: WorkItemStatus,
    pub summary: String,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub escalated: bool,
}

/// A research micro-task the planner dispatched to the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchRequestMessage {
    pub request_id: String,
    pub query: String,
    pub return_format: String,
    pub max_tokens: u32,
}

/// A research result flowing back to the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchResultMessage {
    pub request_id: String,
    pub result: String,
    #[serde(default)]
    pub message_id: Option<String>,
}

/// Planner guidance for a stuck executor (consult reply).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerGuidance {
    pub work_item_id: String,
    pub guidance: String,
}

/// Surface an approval request to the owner's channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequestMessage {
    pub token_id: String,
    pub work_item_id: String,
    pub scope: ApprovalScope,
    pub description: String,
}

/// An approval verdict flowing back to the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResultMessage {
    pub token_id: String,
    pub work_item_id: String,
    pub verdict: ApprovalVerdict,
}

/// An inbound user message entering the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    pub text: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default = "default_taint")]
    pub taint: TaintLevel,
}

fn default_taint() -> TaintLevel {
    TaintLevel::External
}

/// A direct agent response back to the user's channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub text: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Kernel-internal event (goal fired, approval declined, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Tagged payload; the variant determines routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePayload {
    PlanRequest(PlanRequest),
    ReplanRequest(ReplanRequest),
    PlanResult(PlanResult),
    ExecutionRequest(ExecutionRequest),
    ExecutionStatus(ExecutionStatus),
    ResearchRequest(ResearchRequestMessage),
    ResearchResult(ResearchResultMessage),
    PlannerGuidance(PlannerGuidance),
    ApprovalRequest(ApprovalRequestMessage),
    ApprovalResult(ApprovalResultMessage),
    UserMessage(UserMessage),
    AgentResponse(AgentResponse),
    SystemEvent(SystemEvent),
}

impl MessagePayload {
    /// The kind discriminator for this payload.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::PlanRequest(_) => MessageKind::PlanRequest,
            Self::ReplanRequest(_) => MessageKind::ReplanRequest,
            Self::PlanResult(_) => MessageKind::PlanResult,
            Self::ExecutionRequest(_) => MessageKind::ExecutionRequest,
            Self::ExecutionStatus(_) => MessageKind::ExecutionStatus,
            Self::ResearchRequest(_) => MessageKind::ResearchRequest,
            Self::ResearchResult(_) => MessageKind::ResearchResult,
            Self::PlannerGuidance(_) => MessageKind::PlannerGuidance,
            Self::ApprovalRequest(_) => MessageKind::ApprovalRequest,
            Self::ApprovalResult(_) => MessageKind::ApprovalResult,
            Self::UserMessage(_) => MessageKind::UserMessage,
            Self::AgentResponse(_) => MessageKind::AgentResponse,
            Self::SystemEvent(_) => MessageKind::SystemEvent,
        }
    }
}

/// One message on the bus.
///
/// Lifetime: enqueued → leased → acked (success) or returned (retry).
/// A lease that outlives the TTL is reclaimed by the next
/// [`lease`](crate::queue::QueueStore::lease).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    pub sender: String,
    pub trace_id: String,
    /// Destination queue; set by the router before enqueue.
    #[serde(default)]
    pub queue_name: String,
    pub payload: MessagePayload,
    #[serde(default)]
    pub urgency: i32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub leased_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
}

impl QueueMessage {
    /// Build an unrouted message with a fresh id and trace id.
    pub fn new(sender: impl Into<String>, payload: MessagePayload) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            sender: sender.into(),
            trace_id: Uuid::new_v4().simple().to_string(),
            queue_name: String::new(),
            payload,
            urgency: 0,
            created_at: Utc::now(),
            leased_at: None,
            attempts: 0,
        }
    }

    /// Build a message correlated to an existing trace.
    pub fn with_trace(
        sender: impl Into<String>,
        trace_id: impl Into<String>,
        payload: MessagePayload,
    ) -> Self {
        let mut msg = Self::new(sender, payload);
        msg.trace_id = trace_id.into();
        msg
    }

    /// The payload's kind discriminator.
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}
