//! Batch review surface for pending approval requests.
//!
//! Queues approval requests so a reviewer can poll and resolve them in
//! batch instead of context-switching on every request. Sits between
//! [`ApprovalManager`](crate::approval::ApprovalManager) (producer) and
//! a polling UI (consumer). Single-owner: callers must synchronize if
//! the queue is shared.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::approval::token::{ApprovalScope, ApprovalToken, ApprovalVerdict};

/// Default review time-to-live in seconds.
const DEFAULT_TTL_SECS: i64 = 300;

/// Lightweight request descriptor for the review queue.
///
/// Separate from the work-item model so the approval subsystem stays
/// decoupled from execution internals.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub work_item_id: String,
    pub plan_hash: String,
    pub scope: ApprovalScope,
    pub description: String,
}

/// Reviewer's verdict — `Defer` keeps the item queued for later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approve,
    Deny,
    Defer,
}

/// Snapshot of a queued approval request awaiting human review.
#[derive(Debug, Clone)]
pub struct PendingReview {
    pub review_id: String,
    pub request: ApprovalRequest,
    /// Higher = more urgent; drives poll ordering.
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Priority tiers — scopes needing faster human attention rank higher.
fn priority_for(scope: ApprovalScope) -> i32 {
    match scope {
        ApprovalScope::SelfUpdate => 90,
        ApprovalScope::CredentialUse => 80,
        ApprovalScope::Budget => 70,
        ApprovalScope::SkillInstall => 60,
        ApprovalScope::ConnectionManage => 50,
        ApprovalScope::ConnectionAct => 40,
        ApprovalScope::AutonomyThreshold => 30,
        _ => 10,
    }
}

/// In-memory queue of pending reviews, ordered by priority then age.
#[derive(Debug)]
pub struct ReviewQueue {
    reviews: HashMap<String, PendingReview>,
    default_ttl: Duration,
}

impl Default for ReviewQueue {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_TTL_SECS))
    }
}

impl ReviewQueue {
    /// Create a queue with the given default review TTL.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            reviews: HashMap::new(),
            default_ttl,
        }
    }

    /// Sorted view: highest priority first, oldest first within a tier.
    pub fn pending_reviews(&self) -> Vec<&PendingReview> {
        let mut reviews: Vec<&PendingReview> = self.reviews.values().collect();
        reviews.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        reviews
    }

    /// Add an approval request and return the queued review.
    pub fn enqueue(&mut self, request: ApprovalRequest, ttl: Option<Duration>) -> PendingReview {
        let now = Utc::now();
        let review = PendingReview {
            review_id: Uuid::new_v4().simple().to_string(),
            priority: priority_for(request.scope),
            request,
            created_at: now,
            expires_at: now + ttl.unwrap_or(self.default_ttl),
        };
        self.reviews.insert(review.review_id.clone(), review.clone());
        review
    }

    /// Up to `limit` pending reviews in priority order, for batch review.
    pub fn poll(&self, limit: usize) -> Vec<PendingReview> {
        self.pending_reviews()
            .into_iter()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Resolve a single review.
    ///
    /// `Approve` removes it and returns a token stub (real cryptographic
    /// signing happens in the verifier — the stub carries enough identity
    /// to bind later). `Deny` removes it and returns nothing. `Defer`
    /// leaves it in place. Unknown ids return `Err`.
    pub fn resolve(
        &mut self,
        review_id: &str,
        decision: ReviewDecision,
    ) -> Result<Option<ApprovalToken>, super::token::ApprovalError> {
        if !self.reviews.contains_key(review_id) {
            return Err(super::token::ApprovalError::Unknown(review_id.to_owned()));
        }

        if decision == ReviewDecision::Defer {
            return Ok(None);
        }

        // Presence was checked above; remove cannot miss.
        let Some(review) = self.reviews.remove(review_id) else {
            return Err(super::token::ApprovalError::Unknown(review_id.to_owned()));
        };

        if decision == ReviewDecision::Deny {
            return Ok(None);
        }

        let now = Utc::now();
        Ok(Some(ApprovalToken {
            token_id: Uuid::new_v4().simple().to_string(),
            plan_hash: review.request.plan_hash,
            work_item_id: review.request.work_item_id,
            scope: review.request.scope,
            verdict: ApprovalVerdict::Approved,
            signature: b"review-queue-stub".to_vec(),
            issued_at: now,
            expires_at: review.expires_at.max(now + Duration::seconds(1)),
            nonce: Uuid::new_v4().simple().to_string(),
            approval_strength: "tap".to_owned(),
            conditions: serde_json::Map::new(),
            executions_used: 0,
            max_executions: 1,
            execution_nonces: Vec::new(),
        }))
    }

    /// Resolve several reviews; result order matches input order.
    pub fn resolve_batch(
        &mut self,
        decisions: &[(String, ReviewDecision)],
    ) -> Vec<Result<Option<ApprovalToken>, super::token::ApprovalError>> {
        decisions
            .iter()
            .map(|(id, decision)| self.resolve(id, *decision))
            .collect()
    }

    /// Remove reviews older than `max_age`. Returns the count removed.
    pub fn expire_stale(&mut self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let stale: Vec<String> = self
            .reviews
            .iter()
            .filter(|(_, r)| r.created_at <= cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        let count = stale.len();
        for id in stale {
            self.reviews.remove(&id);
        }
        count
    }

    /// Number of reviews currently queued.
    pub fn len(&self) -> usize {
        self.reviews.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.reviews.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(scope: ApprovalScope) -> ApprovalRequest {
        ApprovalRequest {
            request_id: Uuid::new_v4().simple().to_string(),
            work_item_id: "wi-1".to_owned(),
            plan_hash: "ab".repeat(32),
            scope,
            description: "test request".to_owned(),
        }
    }

    #[test]
    fn test_priority_ordering() {
        let mut queue = ReviewQueue::default();
        queue.enqueue(request(ApprovalScope::FullPlan), None);
        queue.enqueue(request(ApprovalScope::SelfUpdate), None);
        queue.enqueue(request(ApprovalScope::Budget), None);

        let ordered = queue.poll(10);
        assert_eq!(ordered[0].request.scope, ApprovalScope::SelfUpdate);
        assert_eq!(ordered[0].priority, 90);
        assert_eq!(ordered[1].request.scope, ApprovalScope::Budget);
        assert_eq!(ordered[2].request.scope, ApprovalScope::FullPlan);
        assert_eq!(ordered[2].priority, 10);
    }

    #[test]
    fn test_fifo_within_tier() {
        let mut queue = ReviewQueue::default();
        let first = queue.enqueue(request(ApprovalScope::FullPlan), None);
        let second = queue.enqueue(request(ApprovalScope::FullPlan), None);
        let ordered = queue.poll(10);
        assert_eq!(ordered[0].review_id, first.review_id);
        assert_eq!(ordered[1].review_id, second.review_id);
    }

    #[test]
    fn test_approve_returns_token_stub() {
        let mut queue = ReviewQueue::default();
        let review = queue.enqueue(request(ApprovalScope::SingleStep), None);
        let token = queue
            .resolve(&review.review_id, ReviewDecision::Approve)
            .expect("known review")
            .expect("approve yields stub");
        assert_eq!(token.verdict, ApprovalVerdict::Approved);
        assert_eq!(token.work_item_id, "wi-1");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_deny_removes_without_token() {
        let mut queue = ReviewQueue::default();
        let review = queue.enqueue(request(ApprovalScope::SingleStep), None);
        let token = queue
            .resolve(&review.review_id, ReviewDecision::Deny)
            .expect("known review");
        assert!(token.is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_defer_keeps_in_queue() {
        let mut queue = ReviewQueue::default();
        let review = queue.enqueue(request(ApprovalScope::SingleStep), None);
        let token = queue
            .resolve(&review.review_id, ReviewDecision::Defer)
            .expect("known review");
        assert!(token.is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_unknown_review_errors() {
        let mut queue = ReviewQueue::default();
        assert!(queue.resolve("nope", ReviewDecision::Approve).is_err());
    }

    #[test]
    fn test_resolve_batch_order_matches_input() {
        let mut queue = ReviewQueue::default();
        let a = queue.enqueue(request(ApprovalScope::SingleStep), None);
        let b = queue.enqueue(request(ApprovalScope::SingleStep), None);
        let results = queue.resolve_batch(&[
            (a.review_id.clone(), ReviewDecision::Approve),
            (b.review_id.clone(), ReviewDecision::Deny),
        ]);
        assert!(results[0].as_ref().expect("ok").is_some());
        assert!(results[1].as_ref().expect("ok").is_none());
    }

    #[test]
    fn test_expire_stale() {
        let mut queue = ReviewQueue::default();
        let review = queue.enqueue(request(ApprovalScope::SingleStep), None);
        // Backdate it beyond the cutoff.
        if let Some(entry) = queue.reviews.get_mut(&review.review_id) {
            entry.created_at = Utc::now() - Duration::seconds(600);
        }
        assert_eq!(queue.expire_stale(Duration::seconds(300)), 1);
        assert!(queue.is_empty());
    }
}
