//! The work-item data model and canonical plan hashing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::approval::ApprovalToken;
use crate::canonical::{sha256_hex, to_canonical_bytes};

/// Work subsystem errors.
#[derive(Debug, Error)]
pub enum WorkError {
    /// Malformed plan markdown or front matter.
    #[error("plan parse error: {0}")]
    Parse(String),
    /// A model invariant was violated.
    #[error("invalid work item: {0}")]
    Validation(String),
    /// SQLite failure in the work-item store.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// JSON (de)serialization failure on a stored column.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Kind of work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkItemType {
    /// A single concrete task.
    Task,
    /// A multi-task container.
    Project,
    /// A long-lived objective that spawns tasks.
    Goal,
}

impl WorkItemType {
    /// String form stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Project => "project",
            Self::Goal => "goal",
        }
    }
}

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkItemStatus {
    Pending,
    Running,
    Healthy,
    Done,
    Failed,
    Stuck,
    Blocked,
    Paused,
}

impl WorkItemStatus {
    /// String form stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Healthy => "healthy",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Stuck => "stuck",
            Self::Blocked => "blocked",
            Self::Paused => "paused",
        }
    }
}

/// Agent lane a work item executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentLane {
    /// Spawned per work item, torn down after.
    Ephemeral,
    /// The always-on stream agent (goals with `schedule = always_on`).
    Stream,
}

/// How much the user wants to be interrupted during execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionMode {
    ConfirmEverything,
    ConfirmOnlyWhenRequired,
    Autonomous,
}

impl Default for InteractionMode {
    fn default() -> Self {
        Self::ConfirmOnlyWhenRequired
    }
}

/// Resource ceilings for one work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Budget {
    pub max_tokens: u64,
    pub max_cost_usd: f64,
    pub max_wall_time_seconds: u32,
    pub max_attempts: u32,
    pub max_planner_calls: u32,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_tokens: 200_000,
            max_cost_usd: 2.0,
            max_wall_time_seconds: 1_800,
            max_attempts: 5,
            max_planner_calls: 3,
        }
    }
}

/// Accumulated resource usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetUsed {
    pub tokens: u64,
    pub cost_usd: f64,
    pub wall_time_seconds: f64,
    pub attempts: u32,
    pub planner_calls: u32,
    pub executor_runs: u32,
}

impl BudgetUsed {
    /// Whether any dimension has reached its ceiling.
    pub fn exceeds(&self, budget: &Budget) -> bool {
        self.exceeded_dimension(budget).is_some()
    }

    /// Name of the first exceeded budget dimension, if any.
    ///
    /// User-visible budget failures identify the dimension that tripped.
    pub fn exceeded_dimension(&self, budget: &Budget) -> Option<&'static str> {
        if self.tokens >= budget.max_tokens {
            return Some("tokens");
        }
        if self.cost_usd >= budget.max_cost_usd {
            return Some("cost_usd");
        }
        if self.wall_time_seconds >= f64::from(budget.max_wall_time_seconds) {
            return Some("wall_time_seconds");
        }
        if self.attempts >= budget.max_attempts {
            return Some("attempts");
        }
        if self.planner_calls >= budget.max_planner_calls {
            return Some("planner_calls");
        }
        None
    }

    /// Fold a child's usage into this one.
    pub fn merge(&mut self, child: &BudgetUsed) {
        self.tokens = self.tokens.saturating_add(child.tokens);
        self.cost_usd += child.cost_usd;
        self.wall_time_seconds += child.wall_time_seconds;
        self.attempts = self.attempts.saturating_add(child.attempts);
        self.planner_calls = self.planner_calls.saturating_add(child.planner_calls);
        self.executor_runs = self.executor_runs.saturating_add(child.executor_runs);
    }
}

/// One predicate a verification check asserts about its command output.
///
/// Exactly one field must be set; [`Expectation::validate`] enforces it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Expectation {
    pub exit_code: Option<i32>,
    pub equals: Option<String>,
    pub contains: Option<String>,
    pub regex: Option<String>,
    pub output_lt: Option<f64>,
    pub output_gt: Option<f64>,
    pub file_exists: Option<String>,
    pub not_empty: Option<bool>,
}

impl Expectation {
    /// Ensure exactly one predicate is defined.
    pub fn validate(&self) -> Result<(), WorkError> {
        let selected = [
            self.exit_code.is_some(),
            self.equals.is_some(),
            self.contains.is_some(),
            self.regex.is_some(),
            self.output_lt.is_some(),
            self.output_gt.is_some(),
            self.file_exists.is_some(),
            self.not_empty == Some(true),
        ]
        .iter()
        .filter(|v| **v)
        .count();
        if selected != 1 {
            return Err(WorkError::Validation(
                "expectation must define exactly one predicate".to_owned(),
            ));
        }
        Ok(())
    }
}

/// A post-execution verification command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationCheck {
    pub name: String,
    pub run: String,
    pub expect: Expectation,
    #[serde(default = "default_check_timeout")]
    pub timeout: u32,
    #[serde(default)]
    pub network: bool,
}

fn default_check_timeout() -> u32 {
    60
}

/// What to do when a named escalation trigger fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationAction {
    pub action: String,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub instruction: Option<String>,
    #[serde(default = "default_escalation_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub fallback: Option<String>,
}

fn default_escalation_retries() -> u32 {
    2
}

/// A policy gate evaluated around execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gate {
    pub name: String,
    pub trigger: String,
    pub action: String,
    #[serde(default)]
    pub pattern: Option<String>,
}

/// Filesystem/tool access granted at a named level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessLevel {
    pub paths: Vec<String>,
    pub tools: Vec<String>,
    pub network: bool,
}

impl Default for AccessLevel {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            tools: Vec::new(),
            network: false,
        }
    }
}

/// The unit of execution.
///
/// Immutable planning fields participate in [`plan_hash`](Self::plan_hash);
/// mutable execution state (status, attempts, budget_used, the attached
/// token, verification results) is excluded so approved content stays
/// tamper-evident across the item's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: WorkItemType,
    pub title: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub spawned_by: Option<String>,
    #[serde(default)]
    pub follow_up_of: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,

    #[serde(default = "default_agent_lane")]
    pub agent: AgentLane,
    #[serde(default)]
    pub budget: Budget,
    #[serde(default = "default_needs_approval")]
    pub needs_approval: bool,
    #[serde(default)]
    pub approval_token: Option<ApprovalToken>,

    pub body: String,
    #[serde(default)]
    pub interaction_mode: InteractionMode,
    #[serde(default)]
    pub input_artifacts_from: Vec<String>,

    #[serde(default)]
    pub verify: Vec<VerificationCheck>,
    #[serde(default)]
    pub gates: Vec<Gate>,
    #[serde(default)]
    pub skills: Vec<String>,

    #[serde(default)]
    pub access_levels: std::collections::BTreeMap<String, AccessLevel>,
    #[serde(default)]
    pub escalation: std::collections::BTreeMap<String, EscalationAction>,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default = "default_on_failure")]
    pub on_failure: String,
    #[serde(default = "default_on_stuck")]
    pub on_stuck: String,
    #[serde(default)]
    pub failure_context: Option<String>,

    #[serde(default)]
    pub tasks: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default = "default_status")]
    pub status: WorkItemStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub budget_used: BudgetUsed,
    #[serde(default)]
    pub verification_results: Vec<Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_agent_lane() -> AgentLane {
    AgentLane::Ephemeral
}

fn default_needs_approval() -> bool {
    true
}

fn default_on_failure() -> String {
    "report".to_owned()
}

fn default_on_stuck() -> String {
    "consult_planner".to_owned()
}

fn default_status() -> WorkItemStatus {
    WorkItemStatus::Pending
}

impl WorkItem {
    /// Build a minimal task with defaults for everything else.
    pub fn task(id: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            item_type: WorkItemType::Task,
            title: title.into(),
            parent: None,
            spawned_by: None,
            follow_up_of: None,
            domain: None,
            agent: AgentLane::Ephemeral,
            budget: Budget::default(),
            needs_approval: true,
            approval_token: None,
            body: body.into(),
            interaction_mode: InteractionMode::default(),
            input_artifacts_from: Vec::new(),
            verify: Vec::new(),
            gates: Vec::new(),
            skills: Vec::new(),
            access_levels: std::collections::BTreeMap::new(),
            escalation: std::collections::BTreeMap::new(),
            schedule: None,
            on_failure: default_on_failure(),
            on_stuck: default_on_stuck(),
            failure_context: None,
            tasks: Vec::new(),
            depends_on: Vec::new(),
            status: WorkItemStatus::Pending,
            attempts: 0,
            budget_used: BudgetUsed::default(),
            verification_results: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Enforce agent-lane invariants, upgrading where the model allows it.
    ///
    /// Tasks and projects must run on the ephemeral lane. A goal scheduled
    /// `always_on` is moved onto the stream lane.
    pub fn validate_lane(&mut self) -> Result<(), WorkError> {
        match self.item_type {
            WorkItemType::Task | WorkItemType::Project => {
                if self.agent != AgentLane::Ephemeral {
                    return Err(WorkError::Validation(
                        "task and project work items must use the ephemeral agent lane".to_owned(),
                    ));
                }
            }
            WorkItemType::Goal => {
                if self.schedule.as_deref() == Some("always_on") && self.agent == AgentLane::Ephemeral
                {
                    self.agent = AgentLane::Stream;
                }
            }
        }
        for check in &self.verify {
            check.expect.validate()?;
        }
        Ok(())
    }

    /// Canonical bytes of the approval-relevant projection.
    ///
    /// Excluded by design: `status`, `attempts`, `budget_used`,
    /// `created_at`, `approval_token`, `verification_results`.
    pub fn plan_hash_bytes(&self) -> Vec<u8> {
        let projection = json!({
            "id": self.id,
            "type": self.item_type,
            "title": self.title,
            "parent": self.parent,
            "spawned_by": self.spawned_by,
            "follow_up_of": self.follow_up_of,
            "domain": self.domain,
            "agent": self.agent,
            "budget": self.budget,
            "body": self.body,
            "interaction_mode": self.interaction_mode,
            "input_artifacts_from": self.input_artifacts_from,
            "verify": self.verify,
            "gates": self.gates,
            "skills": self.skills,
            "access_levels": self.access_levels,
            "escalation": self.escalation,
            "schedule": self.schedule,
            "on_failure": self.on_failure,
            "on_stuck": self.on_stuck,
            "failure_context": self.failure_context,
            "tasks": self.tasks,
            "depends_on": self.depends_on,
        });
        to_canonical_bytes(&projection)
    }

    /// SHA-256 of [`plan_hash_bytes`](Self::plan_hash_bytes), lowercase hex.
    pub fn plan_hash(&self) -> String {
        sha256_hex(&self.plan_hash_bytes())
    }
}

/// Outcome of executing one work item (possibly including its subtree).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItemResult {
    pub work_item_id: String,
    pub status: WorkItemStatus,
    pub summary: String,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub verification_results: Vec<Value>,
    #[serde(default)]
    pub budget_used: BudgetUsed,
    #[serde(default)]
    pub artifacts: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
}

impl WorkItemResult {
    /// A failed result with the given error.
    pub fn failed(work_item_id: impl Into<String>, summary: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            work_item_id: work_item_id.into(),
            status: WorkItemStatus::Failed,
            summary: summary.into(),
            last_error: Some(error.into()),
            verification_results: Vec::new(),
            budget_used: BudgetUsed::default(),
            artifacts: std::collections::BTreeMap::new(),
            next_steps: Vec::new(),
        }
    }

    /// A successful result with the given summary.
    pub fn done(work_item_id: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            work_item_id: work_item_id.into(),
            status: WorkItemStatus::Done,
            summary: summary.into(),
            last_error: None,
            verification_results: Vec::new(),
            budget_used: BudgetUsed::default(),
            artifacts: std::collections::BTreeMap::new(),
            next_steps: Vec::new(),
        }
    }
}
