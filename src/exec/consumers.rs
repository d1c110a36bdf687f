//! Queue consumers for the proxy, planner, and executor roles.
//!
//! Each consumer polls its queue and processes one message per
//! iteration, acking on success. The LLM agents behind each role are
//! external collaborators expressed as traits; the consumers own the
//! kernel-side mechanics — approval gating, research tracking, and the
//! recovery cascade (retry → consult → guided retry → replan →
//! escalate).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::approval::{
    ApprovalDecision, ApprovalManager, ApprovalOutcome, ApprovalScope, ApprovalVerdict,
    ApprovalVerifier,
};
use crate::exec::consult::ConsultManager;
use crate::exec::replan::ReplanManager;
use crate::exec::research::{ResearchState, ResearchStateMachine};
use crate::goals::GoalManager;
use crate::queue::{
    queues, AgentResponse, ApprovalRequestMessage, ExecutionRequest, ExecutionStatus, MessageKind,
    MessagePayload, PlanRequest, PlanResult, PlannerGuidance, QueueError, QueueMessage, QueueStore,
    ResearchRequestMessage, ResearchResultMessage, Router, SystemEvent,
};
use crate::types::TaintLevel;
use crate::work::{PlanParser, WorkItem, WorkItemRunner, WorkItemStatus};

/// Default wait for a human approval verdict.
const DEFAULT_APPROVAL_WAIT_SECS: u64 = 300;

/// Poll interval while waiting for an approval verdict.
const APPROVAL_POLL_MS: u64 = 100;

/// A queue consumer: one queue, one message per poll.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// The queue this consumer drains.
    fn queue_name(&self) -> &'static str;

    /// Process at most one message. Returns whether one was found.
    async fn poll_once(&self) -> Result<bool, QueueError>;
}

// ── Agent seams ─────────────────────────────────────────────────────

/// Proxy decision on an inbound user message.
#[derive(Debug, Clone)]
pub enum ProxyDecision {
    /// Route to the planner.
    Plan { request: String },
    /// Answer directly without planning.
    Respond { text: String },
}

/// The proxy agent: classifies and routes inbound messages.
#[async_trait]
pub trait ProxyAgent: Send + Sync {
    /// Decide what to do with a user message.
    async fn handle_user_message(&self, text: &str, taint: TaintLevel) -> ProxyDecision;
}

/// What the planner produced for one request.
#[derive(Debug, Clone, Default)]
pub struct PlannerOutput {
    /// A finished plan (markdown with front matter), if ready.
    pub plan_markdown: Option<String>,
    /// Research the planner wants before finalizing.
    pub research_requests: Vec<ResearchAsk>,
}

/// One research question from the planner.
#[derive(Debug, Clone)]
pub struct ResearchAsk {
    pub query: String,
    pub return_format: String,
    pub max_tokens: u32,
}

/// The planner agent: produces plans, guidance, and finalizations.
#[async_trait]
pub trait PlannerAgent: Send + Sync {
    /// Plan for a request (may ask for research instead of a plan).
    async fn plan(&self, request: &str, replan_depth: u32, failure_context: Option<&str>)
        -> PlannerOutput;

    /// Finalize a plan once research results (possibly partial) are in.
    async fn finalize(&self, request: &str, research: &HashMap<String, String>) -> String;

    /// Guidance for a stuck executor (consult reply).
    async fn guidance(&self, work_item_id: &str, failure_context: &str) -> String;
}

/// The executor-side research agent.
#[async_trait]
pub trait ExecutorAgent: Send + Sync {
    /// Answer a research micro-task.
    async fn research(&self, query: &str, return_format: &str, max_tokens: u32) -> String;
}

// ── Proxy consumer ──────────────────────────────────────────────────

/// Routes user messages through the proxy agent and turns plan results
/// into approved execution requests.
///
/// Outbound traffic for the owner's channel (agent responses, execution
/// status, approval prompts) is forwarded on `outbound`; the channel
/// adapter on the other end is outside the kernel.
pub struct ProxyConsumer {
    agent: Arc<dyn ProxyAgent>,
    store: QueueStore,
    router: Router,
    parser: PlanParser,
    approvals: Arc<Mutex<ApprovalManager>>,
    goals: Arc<Mutex<GoalManager>>,
    verifier: Arc<ApprovalVerifier>,
    approval_wait: Duration,
    outbound: Option<tokio::sync::mpsc::Sender<QueueMessage>>,
}

impl ProxyConsumer {
    /// Wire the proxy consumer.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent: Arc<dyn ProxyAgent>,
        store: QueueStore,
        router: Router,
        approvals: Arc<Mutex<ApprovalManager>>,
        goals: Arc<Mutex<GoalManager>>,
        verifier: Arc<ApprovalVerifier>,
        outbound: Option<tokio::sync::mpsc::Sender<QueueMessage>>,
    ) -> Self {
        Self {
            agent,
            store,
            router,
            parser: PlanParser,
            approvals,
            goals,
            verifier,
            approval_wait: Duration::from_secs(DEFAULT_APPROVAL_WAIT_SECS),
            outbound,
        }
    }

    /// Shorten the human-approval wait (tests, impatient setups).
    pub fn with_approval_wait(mut self, wait: Duration) -> Self {
        self.approval_wait = wait;
        self
    }

    async fn handle(&self, msg: QueueMessage) -> Result<(), QueueError> {
        match msg.payload.clone() {
            MessagePayload::UserMessage(user) => {
                match self.agent.handle_user_message(&user.text, user.taint).await {
                    ProxyDecision::Plan { request } => {
                        let plan = QueueMessage::with_trace(
                            "proxy",
                            &msg.trace_id,
                            MessagePayload::PlanRequest(PlanRequest {
                                text: request,
                                scope_id: user.session_id,
                                consult: false,
                                work_item_id: None,
                                failure_context: None,
                            }),
                        );
                        self.router.route(plan).await?;
                    }
                    ProxyDecision::Respond { text } => {
                        self.router
                            .route(QueueMessage::with_trace(
                                "proxy",
                                &msg.trace_id,
                                MessagePayload::AgentResponse(AgentResponse {
                                    text,
                                    session_id: user.session_id,
                                }),
                            ))
                            .await?;
                    }
                }
            }
            MessagePayload::PlanResult(plan) => {
                self.handle_plan_result(&msg, plan).await?;
            }
            // Channel-bound traffic: hand off to the adapter seam.
            MessagePayload::AgentResponse(_)
            | MessagePayload::ExecutionStatus(_)
            | MessagePayload::ApprovalRequest(_)
            | MessagePayload::SystemEvent(_) => {
                if let Some(outbound) = &self.outbound {
                    let _ = outbound.send(msg.clone()).await;
                } else {
                    debug!(kind = msg.kind().as_str(), "no channel adapter attached, dropping");
                }
            }
            other => {
                warn!(kind = other.kind().as_str(), "unexpected message on proxy queue");
            }
        }
        Ok(())
    }

    async fn handle_plan_result(
        &self,
        msg: &QueueMessage,
        plan: PlanResult,
    ) -> Result<(), QueueError> {
        let item = match self.parser.parse(&plan.plan_markdown) {
            Ok(item) => item,
            Err(err) => {
                warn!(error = %err, "plan result failed to parse");
                self.router
                    .route(QueueMessage::with_trace(
                        "proxy",
                        &msg.trace_id,
                        MessagePayload::AgentResponse(AgentResponse {
                            text: format!("The planner produced an invalid plan: {err}"),
                            session_id: plan.scope_id,
                        }),
                    ))
                    .await?;
                return Ok(());
            }
        };

        if !item.needs_approval {
            return self.dispatch_execution(msg, item, plan.replan_depth).await;
        }

        // Standing approvals cover goal-spawned items without a human
        // round trip.
        if let Some(parent) = item.parent.clone() {
            let standing = {
                let mut goals = self.goals.lock().await;
                goals.take_standing_token(&parent, &item.plan_hash())
            };
            if let Some(token) = standing {
                info!(work_item_id = %item.id, goal_id = %parent, "standing approval applied");
                let mut approved = item;
                approved.approval_token = Some(token);
                return self.dispatch_execution(msg, approved, plan.replan_depth).await;
            }
        }

        // Manual path: queue the request, surface it to the channel,
        // and wait for the verdict on the runtime queue.
        let pending = {
            let mut approvals = self.approvals.lock().await;
            approvals.request_approval(&item, ApprovalScope::FullPlan, None)
        };
        let ApprovalOutcome::Pending(placeholder) = pending else {
            // request_approval without a goal manager can only be pending.
            return Ok(());
        };

        self.router
            .route(QueueMessage::with_trace(
                "proxy",
                &msg.trace_id,
                MessagePayload::ApprovalRequest(ApprovalRequestMessage {
                    token_id: placeholder.token_id.clone(),
                    work_item_id: item.id.clone(),
                    scope: ApprovalScope::FullPlan,
                    description: item.title.clone(),
                }),
            ))
            .await?;

        match self.await_verdict(&msg.trace_id).await? {
            Some(ApprovalVerdict::Approved) => {
                {
                    let mut approvals = self.approvals.lock().await;
                    let _ = approvals.resolve(
                        &placeholder.token_id,
                        ApprovalVerdict::Approved,
                        "owner",
                    );
                }
                let decision = ApprovalDecision::new(ApprovalVerdict::Approved);
                let mut token = self
                    .verifier
                    .issue_token(&item, &decision, ApprovalScope::FullPlan);
                let mut approved = item;
                let (ok, reason) = self
                    .verifier
                    .verify(&mut token, &approved, None)
                    .await
                    .map_err(QueueError::Database)?;
                if !ok {
                    warn!(reason, "freshly issued token failed verification");
                    return Ok(());
                }
                approved.approval_token = Some(token);
                self.dispatch_execution(msg, approved, plan.replan_depth).await?;
            }
            Some(verdict) => {
                {
                    let mut approvals = self.approvals.lock().await;
                    let _ = approvals.resolve(&placeholder.token_id, verdict, "owner");
                }
                info!(work_item_id = %item.id, verdict = verdict.as_str(), "plan not approved");
                self.router
                    .route(QueueMessage::with_trace(
                        "proxy",
                        &msg.trace_id,
                        MessagePayload::SystemEvent(SystemEvent {
                            event: "plan_approval".to_owned(),
                            data: json!({
                                "work_item_id": item.id,
                                "verdict": verdict.as_str(),
                            }),
                        }),
                    ))
                    .await?;
            }
            None => {
                warn!(work_item_id = %item.id, "approval wait expired");
                self.router
                    .route(QueueMessage::with_trace(
                        "proxy",
                        &msg.trace_id,
                        MessagePayload::SystemEvent(SystemEvent {
                            event: "plan_approval".to_owned(),
                            data: json!({
                                "work_item_id": item.id,
                                "verdict": "expired",
                            }),
                        }),
                    ))
                    .await?;
            }
        }
        Ok(())
    }

    async fn dispatch_execution(
        &self,
        msg: &QueueMessage,
        item: WorkItem,
        replan_depth: u32,
    ) -> Result<(), QueueError> {
        self.router
            .route(QueueMessage::with_trace(
                "proxy",
                &msg.trace_id,
                MessagePayload::ExecutionRequest(ExecutionRequest {
                    work_item: item,
                    scope_id: None,
                    replan_depth,
                }),
            ))
            .await
    }

    async fn await_verdict(
        &self,
        trace_id: &str,
    ) -> Result<Option<ApprovalVerdict>, QueueError> {
        let deadline = tokio::time::Instant::now() + self.approval_wait;
        loop {
            if let Some(msg) = self
                .store
                .lease_matching(queues::RUNTIME, MessageKind::ApprovalResult, trace_id)
                .await?
            {
                self.store.ack(&msg.id).await?;
                if let MessagePayload::ApprovalResult(result) = msg.payload {
                    return Ok(Some(result.verdict));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(APPROVAL_POLL_MS)).await;
        }
    }
}

#[async_trait]
impl Consumer for ProxyConsumer {
    fn queue_name(&self) -> &'static str {
        queues::PROXY
    }

    async fn poll_once(&self) -> Result<bool, QueueError> {
        let Some(msg) = self.store.lease(queues::PROXY).await? else {
            return Ok(false);
        };
        let id = msg.id.clone();
        if let Err(err) = self.handle(msg).await {
            error!(error = %err, "proxy consumer failed, returning message for retry");
            self.store.return_for_retry(&id).await?;
            return Ok(true);
        }
        self.store.ack(&id).await?;
        Ok(true)
    }
}

// ── Planner consumer ────────────────────────────────────────────────

/// Pending planning cycle awaiting research results.
struct PendingPlan {
    request: String,
    trace_id: String,
    replan_depth: u32,
}

/// Runs the planner agent, tracking research through the state machine
/// and answering consult requests with guidance.
pub struct PlannerConsumer {
    agent: Arc<dyn PlannerAgent>,
    store: QueueStore,
    router: Router,
    research: Mutex<ResearchStateMachine>,
    pending: Mutex<Option<PendingPlan>>,
}

impl PlannerConsumer {
    /// Wire the planner consumer.
    pub fn new(
        agent: Arc<dyn PlannerAgent>,
        store: QueueStore,
        router: Router,
        research: ResearchStateMachine,
    ) -> Self {
        Self {
            agent,
            store,
            router,
            research: Mutex::new(research),
            pending: Mutex::new(None),
        }
    }

    async fn handle(&self, msg: QueueMessage) -> Result<(), QueueError> {
        match msg.payload.clone() {
            MessagePayload::PlanRequest(request) if request.consult => {
                let work_item_id = request.work_item_id.unwrap_or_default();
                let failure = request.failure_context.unwrap_or_default();
                let guidance = self.agent.guidance(&work_item_id, &failure).await;
                self.router
                    .route(QueueMessage::with_trace(
                        "planner",
                        &msg.trace_id,
                        MessagePayload::PlannerGuidance(PlannerGuidance {
                            work_item_id,
                            guidance,
                        }),
                    ))
                    .await?;
            }
            MessagePayload::PlanRequest(request) => {
                self.run_planning(&msg, &request.text, 0, request.failure_context.as_deref())
                    .await?;
            }
            MessagePayload::ReplanRequest(replan) => {
                let failure_context = serde_json::to_string(&replan.failure_history).ok();
                self.run_planning(
                    &msg,
                    &replan.original_goal,
                    replan.replan_depth,
                    failure_context.as_deref(),
                )
                .await?;
            }
            MessagePayload::ResearchResult(result) => {
                self.handle_research_result(result).await?;
            }
            other => {
                warn!(kind = other.kind().as_str(), "unexpected message on planner queue");
            }
        }
        Ok(())
    }

    async fn run_planning(
        &self,
        msg: &QueueMessage,
        request: &str,
        replan_depth: u32,
        failure_context: Option<&str>,
    ) -> Result<(), QueueError> {
        let output = self.agent.plan(request, replan_depth, failure_context).await;

        if output.research_requests.is_empty() {
            let plan_markdown = output
                .plan_markdown
                .unwrap_or_else(|| self.empty_plan(request));
            return self.emit_plan(&msg.trace_id, plan_markdown, replan_depth).await;
        }

        // Research round: suppress plan_result until results return or
        // time out.
        let mut research = self.research.lock().await;
        research.reset();
        let now = std::time::Instant::now();
        for (index, ask) in output.research_requests.iter().enumerate() {
            let request_id = format!("{}:{index}", msg.id);
            if !research.request_research(
                &request_id,
                &ask.query,
                &ask.return_format,
                ask.max_tokens,
                now,
            ) {
                debug!(query = %ask.query, "research request rejected by state machine");
                continue;
            }
            self.router
                .route(QueueMessage::with_trace(
                    "planner",
                    &msg.trace_id,
                    MessagePayload::ResearchRequest(ResearchRequestMessage {
                        request_id,
                        query: ask.query.clone(),
                        return_format: ask.return_format.clone(),
                        max_tokens: ask.max_tokens,
                    }),
                ))
                .await?;
        }
        drop(research);

        *self.pending.lock().await = Some(PendingPlan {
            request: request.to_owned(),
            trace_id: msg.trace_id.clone(),
            replan_depth,
        });
        Ok(())
    }

    async fn handle_research_result(
        &self,
        result: ResearchResultMessage,
    ) -> Result<(), QueueError> {
        let ready = {
            let mut research = self.research.lock().await;
            let accepted = research.receive_result(
                &result.request_id,
                &result.result,
                result.message_id.as_deref(),
            );
            if !accepted {
                debug!(request_id = %result.request_id, "research result ignored (dup or late)");
            }
            research.state() == ResearchState::ReadyToFinalize
        };
        if ready {
            self.finalize_pending().await?;
        }
        Ok(())
    }

    /// Expire stale research and finalize with partial results when the
    /// machine says so. Called from the poll loop on idle iterations.
    async fn check_research_timeouts(&self) -> Result<(), QueueError> {
        let state = {
            let mut research = self.research.lock().await;
            research.check_timeouts(std::time::Instant::now());
            research.state()
        };
        match state {
            ResearchState::ReadyToFinalize => self.finalize_pending().await,
            ResearchState::Expired => {
                // All research lost: finalize with nothing rather than
                // stalling the plan forever.
                self.finalize_pending().await
            }
            _ => Ok(()),
        }
    }

    async fn finalize_pending(&self) -> Result<(), QueueError> {
        let Some(pending) = self.pending.lock().await.take() else {
            return Ok(());
        };
        let results = {
            let mut research = self.research.lock().await;
            research.finalize()
        };
        let plan_markdown = self.agent.finalize(&pending.request, &results).await;
        self.emit_plan(&pending.trace_id, plan_markdown, pending.replan_depth)
            .await
    }

    async fn emit_plan(
        &self,
        trace_id: &str,
        plan_markdown: String,
        replan_depth: u32,
    ) -> Result<(), QueueError> {
        self.router
            .route(QueueMessage::with_trace(
                "planner",
                trace_id,
                MessagePayload::PlanResult(PlanResult {
                    plan_markdown,
                    scope_id: None,
                    replan_depth,
                }),
            ))
            .await
    }

    fn empty_plan(&self, request: &str) -> String {
        format!(
            "---\nid: plan-{}\ntype: task\ntitle: Unplanned request\n---\n{request}",
            uuid::Uuid::new_v4().simple()
        )
    }
}

#[async_trait]
impl Consumer for PlannerConsumer {
    fn queue_name(&self) -> &'static str {
        queues::PLANNER
    }

    async fn poll_once(&self) -> Result<bool, QueueError> {
        let Some(msg) = self.store.lease(queues::PLANNER).await? else {
            self.check_research_timeouts().await?;
            return Ok(false);
        };
        let id = msg.id.clone();
        if let Err(err) = self.handle(msg).await {
            error!(error = %err, "planner consumer failed, returning message for retry");
            self.store.return_for_retry(&id).await?;
            return Ok(true);
        }
        self.store.ack(&id).await?;
        Ok(true)
    }
}

// ── Executor consumer ───────────────────────────────────────────────

/// Runs execution requests through the work-item runner, then the
/// recovery cascade on terminal failure.
pub struct ExecutorConsumer {
    agent: Arc<dyn ExecutorAgent>,
    store: QueueStore,
    router: Router,
    runner: Arc<WorkItemRunner>,
    consult: ConsultManager,
    replan: ReplanManager,
}

impl ExecutorConsumer {
    /// Wire the executor consumer.
    pub fn new(
        agent: Arc<dyn ExecutorAgent>,
        store: QueueStore,
        router: Router,
        runner: Arc<WorkItemRunner>,
        consult: ConsultManager,
        replan: ReplanManager,
    ) -> Self {
        Self {
            agent,
            store,
            router,
            runner,
            consult,
            replan,
        }
    }

    async fn handle(&self, msg: QueueMessage) -> Result<(), QueueError> {
        match msg.payload.clone() {
            MessagePayload::ExecutionRequest(request) => {
                self.run_with_cascade(&msg, request).await?;
            }
            MessagePayload::ResearchRequest(research) => {
                let result = self
                    .agent
                    .research(&research.query, &research.return_format, research.max_tokens)
                    .await;
                self.router
                    .route(QueueMessage::with_trace(
                        "executor",
                        &msg.trace_id,
                        MessagePayload::ResearchResult(ResearchResultMessage {
                            request_id: research.request_id,
                            result,
                            message_id: Some(msg.id.clone()),
                        }),
                    ))
                    .await?;
            }
            other => {
                warn!(kind = other.kind().as_str(), "unexpected message on executor queue");
            }
        }
        Ok(())
    }

    /// Retry → consult planner → guided retry → replan → escalate.
    async fn run_with_cascade(
        &self,
        msg: &QueueMessage,
        request: ExecutionRequest,
    ) -> Result<(), QueueError> {
        let item = request.work_item;
        let result = self.runner.run(&item).await;
        if result.status == WorkItemStatus::Done {
            return self.emit_status(&msg.trace_id, &result, false).await;
        }

        let mut failure_history = vec![json!({
            "attempts": result.budget_used.attempts,
            "error": result.last_error,
            "summary": result.summary,
        })];

        // Stuck items configured for consult ask the planner first.
        let guided_result = if item.on_stuck == "consult_planner" {
            let failure_context = result
                .last_error
                .clone()
                .unwrap_or_else(|| result.summary.clone());
            let guidance = self
                .consult
                .consult(&item.id, &item.body, &failure_context, &msg.trace_id)
                .await?;

            if let Some(guidance) = guidance {
                info!(work_item_id = %item.id, "retrying with planner guidance");
                let mut guided = item.clone();
                guided.body = format!("Planner guidance: {guidance}\n\n{}", item.body);
                guided.failure_context = Some(failure_context);
                let guided_result = self.runner.run(&guided).await;
                if guided_result.status == WorkItemStatus::Done {
                    return self.emit_status(&msg.trace_id, &guided_result, false).await;
                }
                failure_history.push(json!({
                    "guided": true,
                    "error": guided_result.last_error,
                    "summary": guided_result.summary,
                }));
                Some(guided_result)
            } else {
                None
            }
        } else {
            None
        };

        let final_result = guided_result.unwrap_or(result);

        // Guidance didn't save it (or never came): ask for a new plan.
        let replanned = self
            .replan
            .trigger_replan(
                &item.id,
                &item.body,
                failure_history,
                &msg.trace_id,
                request.replan_depth,
            )
            .await?;
        if replanned {
            // The planner will produce a fresh strategy; this request
            // is done from the executor's point of view.
            return Ok(());
        }

        // Cascade exhausted.
        let mut escalated = final_result;
        escalated.summary = "All recovery exhausted".to_owned();
        self.emit_status(&msg.trace_id, &escalated, true).await
    }

    async fn emit_status(
        &self,
        trace_id: &str,
        result: &crate::work::WorkItemResult,
        escalated: bool,
    ) -> Result<(), QueueError> {
        self.router
            .route(QueueMessage::with_trace(
                "executor",
                trace_id,
                MessagePayload::ExecutionStatus(ExecutionStatus {
                    work_item_id: result.work_item_id.clone(),
                    status: result.status,
                    summary: result.summary.clone(),
                    last_error: result.last_error.clone(),
                    escalated,
                }),
            ))
            .await
    }
}

#[async_trait]
impl Consumer for ExecutorConsumer {
    fn queue_name(&self) -> &'static str {
        queues::EXECUTOR
    }

    async fn poll_once(&self) -> Result<bool, QueueError> {
        let Some(msg) = self.store.lease(queues::EXECUTOR).await? else {
            return Ok(false);
        };
        let id = msg.id.clone();
        if let Err(err) = self.handle(msg).await {
            error!(error = %err, "executor consumer failed, returning message for retry");
            self.store.return_for_retry(&id).await?;
            return Ok(true);
        }
        self.store.ack(&id).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::pool::ItemExecutor;
    use crate::persistence::open_in_memory;
    use crate::work::WorkItemResult;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct EchoProxy;

    #[async_trait]
    impl ProxyAgent for EchoProxy {
        async fn handle_user_message(&self, text: &str, _taint: TaintLevel) -> ProxyDecision {
            if text.starts_with("plan:") {
                ProxyDecision::Plan {
                    request: text.trim_start_matches("plan:").trim().to_owned(),
                }
            } else {
                ProxyDecision::Respond {
                    text: format!("echo: {text}"),
                }
            }
        }
    }

    struct TemplatePlanner;

    #[async_trait]
    impl PlannerAgent for TemplatePlanner {
        async fn plan(
            &self,
            request: &str,
            _replan_depth: u32,
            _failure_context: Option<&str>,
        ) -> PlannerOutput {
            PlannerOutput {
                plan_markdown: Some(format!(
                    "---\nid: plan-1\ntype: task\ntitle: Planned\nneeds_approval: false\n---\n{request}"
                )),
                research_requests: Vec::new(),
            }
        }

        async fn finalize(&self, request: &str, research: &HashMap<String, String>) -> String {
            format!(
                "---\nid: plan-final\ntype: task\ntitle: Finalized\nneeds_approval: false\n---\n{request} ({} findings)",
                research.len()
            )
        }

        async fn guidance(&self, _work_item_id: &str, _failure_context: &str) -> String {
            "Try using a different approach.".to_owned()
        }
    }

    struct ResearchingPlanner;

    #[async_trait]
    impl PlannerAgent for ResearchingPlanner {
        async fn plan(
            &self,
            _request: &str,
            _replan_depth: u32,
            _failure_context: Option<&str>,
        ) -> PlannerOutput {
            PlannerOutput {
                plan_markdown: None,
                research_requests: vec![ResearchAsk {
                    query: "what is out there".to_owned(),
                    return_format: "summary".to_owned(),
                    max_tokens: 200,
                }],
            }
        }

        async fn finalize(&self, request: &str, research: &HashMap<String, String>) -> String {
            format!(
                "---\nid: plan-res\ntype: task\ntitle: Researched\nneeds_approval: false\n---\n{request} with {} results",
                research.len()
            )
        }

        async fn guidance(&self, _work_item_id: &str, _failure_context: &str) -> String {
            String::new()
        }
    }

    struct StubResearcher;

    #[async_trait]
    impl ExecutorAgent for StubResearcher {
        async fn research(&self, query: &str, _format: &str, _max_tokens: u32) -> String {
            format!("findings for {query}")
        }
    }

    struct FailingExecutor {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ItemExecutor for FailingExecutor {
        async fn execute(&self, work_item: WorkItem) -> WorkItemResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            WorkItemResult::failed(&work_item.id, "failed", "persistent failure")
        }
    }

    async fn bus() -> (QueueStore, Router) {
        let pool = open_in_memory().await.expect("pool");
        let store = QueueStore::new(pool.clone());
        store.initialize().await.expect("initialize");
        (store.clone(), Router::new(store))
    }

    async fn nonce_verifier() -> Arc<ApprovalVerifier> {
        let pool = open_in_memory().await.expect("pool");
        let nonces = crate::persistence::NonceStore::new(pool);
        nonces.initialize().await.expect("init");
        Arc::new(ApprovalVerifier::generate(nonces))
    }

    fn proxy_consumer(
        store: QueueStore,
        router: Router,
        verifier: Arc<ApprovalVerifier>,
    ) -> ProxyConsumer {
        ProxyConsumer::new(
            Arc::new(EchoProxy),
            store,
            router,
            Arc::new(Mutex::new(ApprovalManager::default())),
            Arc::new(Mutex::new(GoalManager::new())),
            verifier,
            None,
        )
        .with_approval_wait(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_user_message_direct_response() {
        let (store, router) = bus().await;
        let consumer = proxy_consumer(store.clone(), router.clone(), nonce_verifier().await);

        router
            .route(QueueMessage::new(
                "channel",
                MessagePayload::UserMessage(crate::queue::UserMessage {
                    text: "hello there".to_owned(),
                    session_id: None,
                    taint: TaintLevel::Owner,
                }),
            ))
            .await
            .expect("route");

        assert!(consumer.poll_once().await.expect("poll"));
        let response = store
            .lease("proxy_queue")
            .await
            .expect("lease")
            .expect("agent response");
        match response.payload {
            MessagePayload::AgentResponse(reply) => assert_eq!(reply.text, "echo: hello there"),
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_user_message_produces_plan_request() {
        let (store, router) = bus().await;
        let consumer = proxy_consumer(store.clone(), router.clone(), nonce_verifier().await);

        router
            .route(QueueMessage::new(
                "channel",
                MessagePayload::UserMessage(crate::queue::UserMessage {
                    text: "plan: organise my week".to_owned(),
                    session_id: None,
                    taint: TaintLevel::Owner,
                }),
            ))
            .await
            .expect("route");

        assert!(consumer.poll_once().await.expect("poll"));
        let request = store
            .lease("planner_queue")
            .await
            .expect("lease")
            .expect("plan request");
        match request.payload {
            MessagePayload::PlanRequest(plan) => {
                assert_eq!(plan.text, "organise my week");
                assert!(!plan.consult);
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_plan_result_without_approval_dispatches() {
        let (store, router) = bus().await;
        let consumer = proxy_consumer(store.clone(), router.clone(), nonce_verifier().await);

        router
            .route(QueueMessage::new(
                "planner",
                MessagePayload::PlanResult(PlanResult {
                    plan_markdown:
                        "---\nid: wi-1\ntype: task\ntitle: Free task\nneeds_approval: false\n---\nbody"
                            .to_owned(),
                    scope_id: None,
                    replan_depth: 0,
                }),
            ))
            .await
            .expect("route");

        assert!(consumer.poll_once().await.expect("poll"));
        let exec = store
            .lease("executor_queue")
            .await
            .expect("lease")
            .expect("execution request");
        match exec.payload {
            MessagePayload::ExecutionRequest(request) => {
                assert_eq!(request.work_item.id, "wi-1");
                assert!(request.work_item.approval_token.is_none());
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_plan_result_approved_carries_verified_token() {
        let (store, router) = bus().await;
        let verifier = nonce_verifier().await;
        let consumer = proxy_consumer(store.clone(), router.clone(), verifier.clone())
            .with_approval_wait(Duration::from_secs(2));

        let plan_msg = QueueMessage::new(
            "planner",
            MessagePayload::PlanResult(PlanResult {
                plan_markdown: "---\nid: wi-2\ntype: task\ntitle: Gated\n---\nbody".to_owned(),
                scope_id: None,
                replan_depth: 0,
            }),
        );
        let trace_id = plan_msg.trace_id.clone();
        router.route(plan_msg).await.expect("route");

        // Pre-plant the owner's verdict on the runtime queue.
        let mut verdict = QueueMessage::with_trace(
            "channel",
            &trace_id,
            MessagePayload::ApprovalResult(crate::queue::ApprovalResultMessage {
                token_id: "ignored".to_owned(),
                work_item_id: "wi-2".to_owned(),
                verdict: ApprovalVerdict::Approved,
            }),
        );
        verdict.queue_name = "runtime_queue".to_owned();
        store.enqueue(&verdict).await.expect("enqueue");

        assert!(consumer.poll_once().await.expect("poll"));

        let exec = store
            .lease("executor_queue")
            .await
            .expect("lease")
            .expect("execution request");
        match exec.payload {
            MessagePayload::ExecutionRequest(request) => {
                let token = request.work_item.approval_token.clone().expect("token attached");
                assert_eq!(token.executions_used, 1, "token consumed at approval time");
                let (ok, reason) = verifier.check(&token, &request.work_item);
                assert!(ok, "attached token must pass the execution check: {reason}");
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_plan_result_declined_emits_event_not_execution() {
        let (store, router) = bus().await;
        let consumer = proxy_consumer(store.clone(), router.clone(), nonce_verifier().await)
            .with_approval_wait(Duration::from_secs(2));

        let plan_msg = QueueMessage::new(
            "planner",
            MessagePayload::PlanResult(PlanResult {
                plan_markdown: "---\nid: wi-3\ntype: task\ntitle: Gated\n---\nbody".to_owned(),
                scope_id: None,
                replan_depth: 0,
            }),
        );
        let trace_id = plan_msg.trace_id.clone();
        router.route(plan_msg).await.expect("route");

        let mut verdict = QueueMessage::with_trace(
            "channel",
            &trace_id,
            MessagePayload::ApprovalResult(crate::queue::ApprovalResultMessage {
                token_id: "ignored".to_owned(),
                work_item_id: "wi-3".to_owned(),
                verdict: ApprovalVerdict::Declined,
            }),
        );
        verdict.queue_name = "runtime_queue".to_owned();
        store.enqueue(&verdict).await.expect("enqueue");

        assert!(consumer.poll_once().await.expect("poll"));
        assert_eq!(store.pending_count("executor_queue").await.expect("count"), 0);

        // Approval prompt + declined event are on the proxy queue.
        let mut saw_declined = false;
        while let Some(msg) = store.lease("proxy_queue").await.expect("lease") {
            if let MessagePayload::SystemEvent(event) = &msg.payload {
                assert_eq!(event.event, "plan_approval");
                assert_eq!(event.data["verdict"], "declined");
                saw_declined = true;
            }
            store.ack(&msg.id).await.expect("ack");
        }
        assert!(saw_declined);
    }

    #[tokio::test]
    async fn test_planner_answers_consult_with_guidance() {
        let (store, router) = bus().await;
        let consumer = PlannerConsumer::new(
            Arc::new(TemplatePlanner),
            store.clone(),
            router.clone(),
            ResearchStateMachine::default(),
        );

        router
            .route(QueueMessage::with_trace(
                "executor",
                "trace-c",
                MessagePayload::PlanRequest(PlanRequest {
                    text: "stuck goal".to_owned(),
                    scope_id: None,
                    consult: true,
                    work_item_id: Some("wi-1".to_owned()),
                    failure_context: Some("attempt 3 failed".to_owned()),
                }),
            ))
            .await
            .expect("route");

        assert!(consumer.poll_once().await.expect("poll"));
        let guidance = store
            .lease_matching("runtime_queue", MessageKind::PlannerGuidance, "trace-c")
            .await
            .expect("lease")
            .expect("guidance");
        match guidance.payload {
            MessagePayload::PlannerGuidance(g) => {
                assert_eq!(g.guidance, "Try using a different approach.");
                assert_eq!(g.work_item_id, "wi-1");
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_planner_research_round_trip() {
        let (store, router) = bus().await;
        let planner = PlannerConsumer::new(
            Arc::new(ResearchingPlanner),
            store.clone(),
            router.clone(),
            ResearchStateMachine::default(),
        );

        router
            .route(QueueMessage::new(
                "proxy",
                MessagePayload::PlanRequest(PlanRequest {
                    text: "research me".to_owned(),
                    scope_id: None,
                    consult: false,
                    work_item_id: None,
                    failure_context: None,
                }),
            ))
            .await
            .expect("route");

        // Plan request → research dispatched, no plan yet.
        assert!(planner.poll_once().await.expect("poll"));
        assert_eq!(store.pending_count("proxy_queue").await.expect("count"), 0);
        let research_msg = store
            .lease("executor_queue")
            .await
            .expect("lease")
            .expect("research request");
        let MessagePayload::ResearchRequest(research) = research_msg.payload.clone() else {
            panic!("expected research request");
        };

        // Executor side answers.
        let nonces = open_in_memory().await.expect("pool");
        let nonce_store = crate::persistence::NonceStore::new(nonces);
        nonce_store.initialize().await.expect("init");
        let runner = Arc::new(WorkItemRunner::new(Arc::new(FailingExecutor {
            calls: AtomicU32::new(0),
        })));
        let executor = ExecutorConsumer::new(
            Arc::new(StubResearcher),
            store.clone(),
            router.clone(),
            runner,
            ConsultManager::with_timeout(
                store.clone(),
                router.clone(),
                Duration::from_millis(50),
            ),
            ReplanManager::new(router.clone()),
        );
        store.ack(&research_msg.id).await.expect("ack leased copy");
        let mut redelivered = QueueMessage::with_trace(
            "planner",
            &research_msg.trace_id,
            MessagePayload::ResearchRequest(research),
        );
        redelivered.queue_name = "executor_queue".to_owned();
        store.enqueue(&redelivered).await.expect("enqueue");
        assert!(executor.poll_once().await.expect("poll"));

        // Result flows back, planner finalizes.
        assert!(planner.poll_once().await.expect("poll"));
        let plan = store
            .lease("proxy_queue")
            .await
            .expect("lease")
            .expect("finalized plan");
        match plan.payload {
            MessagePayload::PlanResult(result) => {
                assert!(result.plan_markdown.contains("with 1 results"));
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }
}
