//! Approval pipeline: signed tokens, the verifier, the pending-approval
//! manager, the batch review queue, and fatigue mitigation.

pub mod fatigue;
pub mod manager;
pub mod review_queue;
pub mod token;
pub mod verifier;

pub use fatigue::{DecisionRecord, FatigueAnalysis, FatigueLevel, FatigueMitigator, Recommendation};
pub use manager::{ApprovalManager, ApprovalOutcome, PendingApproval};
pub use review_queue::{ApprovalRequest, PendingReview, ReviewDecision, ReviewQueue};
pub use token::{
    base64_bytes, ApprovalDecision, ApprovalError, ApprovalScope, ApprovalToken, ApprovalVerdict,
};
pub use verifier::ApprovalVerifier;
