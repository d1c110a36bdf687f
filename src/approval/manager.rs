//! Pending-approval bookkeeping and standing-approval resolution.
//!
//! `request_approval` first consults the goal manager: a valid standing
//! approval covering `(goal_id, plan_hash)` short-circuits the human
//! round trip entirely. Everything else becomes a pending placeholder
//! token plus a review-queue entry prioritized by scope.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::approval::review_queue::{ApprovalRequest, ReviewQueue};
use crate::approval::token::{
    ApprovalDecision, ApprovalError, ApprovalScope, ApprovalToken, ApprovalVerdict,
};
use crate::goals::GoalManager;
use crate::work::WorkItem;

/// Default pending-approval timeout.
const DEFAULT_TIMEOUT_SECS: i64 = 3600;

/// A pending approval awaiting resolution.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub token: ApprovalToken,
    pub requested_at: DateTime<Utc>,
    pub decision: Option<ApprovalDecision>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

/// What `request_approval` produced.
#[derive(Debug, Clone)]
pub enum ApprovalOutcome {
    /// A standing approval covered the request; the bound token is
    /// ready for verification without human involvement.
    Standing(ApprovalToken),
    /// A pending placeholder was queued for review.
    Pending(ApprovalToken),
}

/// Tracks pending approvals and feeds the review queue.
///
/// Single owner per process; wrap in external synchronization to share.
#[derive(Debug)]
pub struct ApprovalManager {
    timeout: Duration,
    pending: HashMap<String, PendingApproval>,
    review_queue: ReviewQueue,
}

impl Default for ApprovalManager {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_TIMEOUT_SECS))
    }
}

impl ApprovalManager {
    /// Create a manager with the given pending-approval timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: HashMap::new(),
            review_queue: ReviewQueue::default(),
        }
    }

    /// Request approval for a work item.
    ///
    /// When `goals` holds a valid standing approval for
    /// `(goal_id, work_item.plan_hash())`, its bound token is returned
    /// and a use is consumed. Otherwise an unsigned placeholder token is
    /// recorded as pending and the request enters the review queue.
    pub fn request_approval(
        &mut self,
        work_item: &WorkItem,
        scope: ApprovalScope,
        goals: Option<&mut GoalManager>,
    ) -> ApprovalOutcome {
        self.prune_expired();

        if let Some(goals) = goals {
            if let Some(goal_id) = work_item.parent.as_deref() {
                let plan_hash = work_item.plan_hash();
                if let Some(token) = goals.take_standing_token(goal_id, &plan_hash) {
                    info!(
                        work_item_id = %work_item.id,
                        goal_id,
                        "standing approval covers request"
                    );
                    return ApprovalOutcome::Standing(token);
                }
            }
        }

        let now = Utc::now();
        let token = ApprovalToken {
            token_id: Uuid::new_v4().simple().to_string(),
            plan_hash: work_item.plan_hash(),
            work_item_id: work_item.id.clone(),
            scope,
            verdict: ApprovalVerdict::Conditional,
            signature: b"pending".to_vec(),
            issued_at: now,
            expires_at: now + self.timeout,
            nonce: Uuid::new_v4().simple().to_string(),
            approval_strength: "tap".to_owned(),
            conditions: serde_json::Map::new(),
            executions_used: 0,
            max_executions: 1,
            execution_nonces: Vec::new(),
        };

        self.pending.insert(
            token.token_id.clone(),
            PendingApproval {
                token: token.clone(),
                requested_at: now,
                decision: None,
                resolved_at: None,
                resolved_by: None,
            },
        );

        self.review_queue.enqueue(
            ApprovalRequest {
                request_id: token.token_id.clone(),
                work_item_id: work_item.id.clone(),
                plan_hash: token.plan_hash.clone(),
                scope,
                description: work_item.title.clone(),
            },
            None,
        );

        debug!(token_id = %token.token_id, scope = scope.as_str(), "approval queued");
        ApprovalOutcome::Pending(token)
    }

    /// Record a verdict on a pending approval.
    ///
    /// Idempotent: the first call sets the decision; later calls return
    /// the original decision untouched.
    pub fn resolve(
        &mut self,
        token_id: &str,
        verdict: ApprovalVerdict,
        resolved_by: &str,
    ) -> Result<ApprovalDecision, ApprovalError> {
        self.prune_expired();
        let pending = self
            .pending
            .get_mut(token_id)
            .ok_or_else(|| ApprovalError::Unknown(token_id.to_owned()))?;

        if let Some(existing) = &pending.decision {
            return Ok(existing.clone());
        }

        let decision = ApprovalDecision::new(verdict);
        pending.decision = Some(decision.clone());
        pending.resolved_at = Some(Utc::now());
        pending.resolved_by = Some(resolved_by.to_owned());
        info!(token_id, verdict = verdict.as_str(), resolved_by, "approval resolved");
        Ok(decision)
    }

    /// Non-destructive decision lookup.
    pub fn check_approval(&mut self, token_id: &str) -> Option<ApprovalDecision> {
        self.prune_expired();
        self.pending.get(token_id).and_then(|p| p.decision.clone())
    }

    /// Unresolved pending approvals.
    pub fn list_pending(&mut self) -> Vec<PendingApproval> {
        self.prune_expired();
        self.pending
            .values()
            .filter(|p| p.decision.is_none())
            .cloned()
            .collect()
    }

    /// Access the underlying review queue.
    pub fn review_queue_mut(&mut self) -> &mut ReviewQueue {
        &mut self.review_queue
    }

    /// Drop pending approvals whose token expired. Called on any access.
    fn prune_expired(&mut self) {
        let now = Utc::now();
        self.pending.retain(|_, p| p.token.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goals::{GoalManager, StandingApproval};

    fn manager() -> ApprovalManager {
        ApprovalManager::default()
    }

    #[test]
    fn test_request_enqueues_pending() {
        let mut mgr = manager();
        let item = WorkItem::task("wi-1", "t", "b");
        let outcome = mgr.request_approval(&item, ApprovalScope::FullPlan, None);
        let token = match outcome {
            ApprovalOutcome::Pending(token) => token,
            ApprovalOutcome::Standing(_) => panic!("no goal manager, no standing path"),
        };
        assert_eq!(token.plan_hash, item.plan_hash());
        assert_eq!(mgr.list_pending().len(), 1);
        assert_eq!(mgr.review_queue_mut().len(), 1);
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let mut mgr = manager();
        let item = WorkItem::task("wi-2", "t", "b");
        let ApprovalOutcome::Pending(token) =
            mgr.request_approval(&item, ApprovalScope::FullPlan, None)
        else {
            panic!("expected pending");
        };

        let first = mgr
            .resolve(&token.token_id, ApprovalVerdict::Approved, "owner")
            .expect("resolve");
        assert_eq!(first.verdict, ApprovalVerdict::Approved);

        // Second resolution with a different verdict returns the original.
        let second = mgr
            .resolve(&token.token_id, ApprovalVerdict::Declined, "owner")
            .expect("resolve");
        assert_eq!(second.verdict, ApprovalVerdict::Approved);
    }

    #[test]
    fn test_resolve_unknown_token_errors() {
        let mut mgr = manager();
        assert!(mgr
            .resolve("missing", ApprovalVerdict::Approved, "owner")
            .is_err());
    }

    #[test]
    fn test_check_approval_reads_decision() {
        let mut mgr = manager();
        let item = WorkItem::task("wi-3", "t", "b");
        let ApprovalOutcome::Pending(token) =
            mgr.request_approval(&item, ApprovalScope::FullPlan, None)
        else {
            panic!("expected pending");
        };
        assert!(mgr.check_approval(&token.token_id).is_none());
        mgr.resolve(&token.token_id, ApprovalVerdict::Declined, "owner")
            .expect("resolve");
        let decision = mgr.check_approval(&token.token_id).expect("decision");
        assert_eq!(decision.verdict, ApprovalVerdict::Declined);
    }

    #[test]
    fn test_expired_pending_pruned() {
        let mut mgr = ApprovalManager::new(Duration::seconds(-1));
        let item = WorkItem::task("wi-4", "t", "b");
        let _ = mgr.request_approval(&item, ApprovalScope::FullPlan, None);
        // Already expired: pruned on the next access.
        assert!(mgr.list_pending().is_empty());
    }

    #[test]
    fn test_standing_approval_short_circuits() {
        let mut goals = GoalManager::new();
        let mut spawned = WorkItem::task("spawn-1", "spawned", "policy body");
        spawned.parent = Some("goal-1".to_owned());
        let policy_hash = spawned.plan_hash();

        goals.add_standing_approval(StandingApproval::test_fixture(
            "appr-1", "goal-1", &policy_hash, 2,
        ));

        let mut mgr = manager();
        let outcome = mgr.request_approval(&spawned, ApprovalScope::Standing, Some(&mut goals));
        assert!(matches!(outcome, ApprovalOutcome::Standing(_)));
        // One use consumed.
        let remaining = goals
            .get_standing_approval("goal-1", &policy_hash)
            .expect("approval still valid")
            .uses_remaining;
        assert_eq!(remaining, Some(1));
    }

    #[test]
    fn test_standing_mismatch_falls_back_to_pending() {
        let mut goals = GoalManager::new();
        let mut spawned = WorkItem::task("spawn-2", "spawned", "policy body");
        spawned.parent = Some("goal-2".to_owned());
        goals.add_standing_approval(StandingApproval::test_fixture(
            "appr-2",
            "goal-2",
            &"ff".repeat(32),
            1,
        ));

        let mut mgr = manager();
        let outcome = mgr.request_approval(&spawned, ApprovalScope::Standing, Some(&mut goals));
        assert!(matches!(outcome, ApprovalOutcome::Pending(_)));
    }
}
