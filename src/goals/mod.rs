//! Goal registry, run tracking, and standing approvals.
//!
//! A goal is a long-lived objective that spawns work items from a
//! template. A standing approval pre-authorizes spawns whose plan hash
//! matches the goal's spawn policy, so routine runs skip the human round
//! trip. Standing approvals are consumable: each dispatch decrements
//! `uses_remaining`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tracing::info;

use crate::approval::ApprovalToken;

/// Goal subsystem errors.
#[derive(Debug, Error)]
pub enum GoalError {
    /// A model invariant was violated.
    #[error("invalid goal data: {0}")]
    Invalid(String),
    /// An illegal run status transition.
    #[error("invalid goal run transition: {0} -> {1}")]
    Transition(&'static str, &'static str),
}

/// When a goal fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum GoalSchedule {
    /// Cron expression.
    Cron { cron_expr: String },
    /// Fixed interval in seconds.
    Interval { interval_seconds: u64 },
    /// One-shot at a fixed time.
    Once { run_at: DateTime<Utc> },
}

impl GoalSchedule {
    /// Shape validation beyond what the tagged enum enforces.
    pub fn validate(&self) -> Result<(), GoalError> {
        match self {
            Self::Cron { cron_expr } if cron_expr.trim().is_empty() => Err(GoalError::Invalid(
                "cron schedules require cron_expr".to_owned(),
            )),
            Self::Interval { interval_seconds } if *interval_seconds == 0 => Err(
                GoalError::Invalid("interval schedules require interval_seconds > 0".to_owned()),
            ),
            _ => Ok(()),
        }
    }
}

/// A registered goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub goal_id: String,
    pub name: String,
    pub description: String,
    pub schedule: GoalSchedule,
    #[serde(default)]
    pub work_template: serde_json::Map<String, Value>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub standing_approval: bool,
    #[serde(default)]
    pub spawn_policy_hash: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

/// Lifecycle status of a goal run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl GoalRunStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// One execution of a goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalRun {
    pub run_id: String,
    pub goal_id: String,
    pub status: GoalRunStatus,
    #[serde(default)]
    pub work_item_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl GoalRun {
    /// New pending run for a goal.
    pub fn new(run_id: impl Into<String>, goal_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            goal_id: goal_id.into(),
            status: GoalRunStatus::Pending,
            work_item_id: None,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Transition to a new status, stamping timestamps.
    ///
    /// Allowed: pending → {running, failed, skipped}; running →
    /// {completed, failed, skipped}. Terminal states accept nothing.
    pub fn transition_to(&mut self, status: GoalRunStatus) -> Result<(), GoalError> {
        if status == self.status {
            return Ok(());
        }
        let allowed = match self.status {
            GoalRunStatus::Pending => matches!(
                status,
                GoalRunStatus::Running | GoalRunStatus::Failed | GoalRunStatus::Skipped
            ),
            GoalRunStatus::Running => matches!(
                status,
                GoalRunStatus::Completed | GoalRunStatus::Failed | GoalRunStatus::Skipped
            ),
            _ => false,
        };
        if !allowed {
            return Err(GoalError::Transition(self.status.as_str(), status.as_str()));
        }

        let now = Utc::now();
        if status == GoalRunStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if matches!(
            status,
            GoalRunStatus::Completed | GoalRunStatus::Failed | GoalRunStatus::Skipped
        ) {
            if self.started_at.is_none() {
                self.started_at = Some(now);
            }
            self.completed_at = Some(now);
        }
        self.status = status;
        Ok(())
    }
}

/// A consumable pre-authorization for goal spawns matching a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandingApproval {
    pub approval_id: String,
    pub goal_id: String,
    pub policy_hash: String,
    pub granted_by: String,
    pub granted_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_uses: Option<u32>,
    #[serde(default)]
    pub uses_remaining: Option<u32>,
    #[serde(default)]
    pub approval_token: Option<ApprovalToken>,
}

impl StandingApproval {
    /// Validate limits and default `uses_remaining` from `max_uses`.
    pub fn validate(&mut self) -> Result<(), GoalError> {
        if let Some(expires_at) = self.expires_at {
            if expires_at <= self.granted_at {
                return Err(GoalError::Invalid(
                    "expires_at must be greater than granted_at".to_owned(),
                ));
            }
        }
        if self.max_uses == Some(0) {
            return Err(GoalError::Invalid("max_uses must be >= 1".to_owned()));
        }
        match (self.uses_remaining, self.max_uses) {
            (None, Some(max)) => self.uses_remaining = Some(max),
            (Some(remaining), Some(max)) if remaining > max => {
                return Err(GoalError::Invalid(
                    "uses_remaining cannot exceed max_uses".to_owned(),
                ));
            }
            _ => {}
        }
        Ok(())
    }

    /// Whether the approval can still authorize a dispatch.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        if let Some(expires_at) = self.expires_at {
            if expires_at <= now {
                return false;
            }
        }
        if let Some(remaining) = self.uses_remaining {
            if remaining == 0 {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
impl StandingApproval {
    /// Test-only fixture: a valid approval with a bound token stub.
    pub fn test_fixture(
        approval_id: &str,
        goal_id: &str,
        policy_hash: &str,
        uses: u32,
    ) -> Self {
        use crate::approval::{ApprovalScope, ApprovalVerdict};
        let now = Utc::now();
        Self {
            approval_id: approval_id.to_owned(),
            goal_id: goal_id.to_owned(),
            policy_hash: policy_hash.to_owned(),
            granted_by: "owner".to_owned(),
            granted_at: now,
            expires_at: Some(now + chrono::Duration::minutes(30)),
            max_uses: Some(uses),
            uses_remaining: Some(uses),
            approval_token: Some(ApprovalToken {
                token_id: format!("standing:{approval_id}"),
                plan_hash: policy_hash.to_owned(),
                work_item_id: goal_id.to_owned(),
                scope: ApprovalScope::Standing,
                verdict: ApprovalVerdict::Approved,
                signature: b"standing-signature".to_vec(),
                issued_at: now,
                expires_at: now + chrono::Duration::minutes(30),
                nonce: format!("nonce:{approval_id}"),
                approval_strength: "tap".to_owned(),
                conditions: {
                    let mut map = serde_json::Map::new();
                    map.insert(
                        "spawn_policy_hash".to_owned(),
                        serde_json::json!(policy_hash),
                    );
                    map
                },
                executions_used: 0,
                max_executions: uses,
                execution_nonces: Vec::new(),
            }),
        }
    }
}

/// In-memory goal registry with standing-approval resolution.
///
/// Single owner per process (typically the proxy consumer's turn loop).
#[derive(Debug, Default)]
pub struct GoalManager {
    goals: HashMap<String, Goal>,
    approvals: HashMap<String, StandingApproval>,
    runs: HashMap<String, GoalRun>,
}

impl GoalManager {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a goal.
    pub fn register(&mut self, goal: Goal) {
        self.goals.insert(goal.goal_id.clone(), goal);
    }

    /// Fetch a goal by id.
    pub fn get(&self, goal_id: &str) -> Option<&Goal> {
        self.goals.get(goal_id)
    }

    /// Remove a goal. Returns whether it existed.
    pub fn unregister(&mut self, goal_id: &str) -> bool {
        self.goals.remove(goal_id).is_some()
    }

    /// List goals, optionally only enabled ones.
    pub fn list_goals(&self, enabled_only: bool) -> Vec<&Goal> {
        self.goals
            .values()
            .filter(|g| !enabled_only || g.enabled)
            .collect()
    }

    /// Attach a standing approval.
    pub fn add_standing_approval(&mut self, approval: StandingApproval) {
        self.approvals.insert(approval.approval_id.clone(), approval);
    }

    /// Find a currently-valid standing approval for `(goal_id, policy_hash)`.
    ///
    /// Policy hashes compare lowercase-normalized, matching the
    /// verifier's binding rule.
    pub fn get_standing_approval(
        &self,
        goal_id: &str,
        policy_hash: &str,
    ) -> Option<&StandingApproval> {
        let now = Utc::now();
        let wanted = policy_hash.to_ascii_lowercase();
        self.approvals.values().find(|a| {
            a.goal_id == goal_id
                && a.policy_hash.to_ascii_lowercase() == wanted
                && a.is_valid(now)
        })
    }

    /// Consume one use of a matching standing approval and return its
    /// bound token. `None` when nothing valid covers the pair.
    pub fn take_standing_token(
        &mut self,
        goal_id: &str,
        policy_hash: &str,
    ) -> Option<ApprovalToken> {
        let approval_id = self
            .get_standing_approval(goal_id, policy_hash)?
            .approval_id
            .clone();
        let approval = self.approvals.get_mut(&approval_id)?;
        if let Some(remaining) = approval.uses_remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
        approval.approval_token.clone()
    }

    /// Record a goal run.
    pub fn record_run(&mut self, run: GoalRun) {
        self.runs.insert(run.run_id.clone(), run);
    }

    /// Fetch a run by id.
    pub fn get_run(&self, run_id: &str) -> Option<&GoalRun> {
        self.runs.get(run_id)
    }

    /// Disable a goal once its objective completes. Returns whether found.
    pub fn deactivate_on_completion(&mut self, goal_id: &str) -> bool {
        let Some(goal) = self.goals.get_mut(goal_id) else {
            return false;
        };
        goal.enabled = false;
        goal.updated_at = Utc::now();
        info!(goal_id, "goal deactivated on completion");
        true
    }
}
