//! Approval token model and canonical signing payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::canonical::to_canonical_bytes;

/// Serde adapter storing raw bytes as base64 strings in JSON.
///
/// Signatures must survive a JSON round trip byte-exact; base64 is the
/// transport form in stored work items and queue payloads.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Approval model errors.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// A token invariant was violated at construction.
    #[error("invalid approval token: {0}")]
    Invalid(String),
    /// Lookup of an unknown token.
    #[error("unknown approval token: {0}")]
    Unknown(String),
}

/// What an approval authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalScope {
    FullPlan,
    SingleStep,
    StepRange,
    ToolType,
    SkillInstall,
    CredentialUse,
    Budget,
    SelfUpdate,
    ConnectionAct,
    ConnectionManage,
    AutonomyThreshold,
    Standing,
}

impl ApprovalScope {
    /// Wire/string form (snake_case), used in canonical payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullPlan => "full_plan",
            Self::SingleStep => "single_step",
            Self::StepRange => "step_range",
            Self::ToolType => "tool_type",
            Self::SkillInstall => "skill_install",
            Self::CredentialUse => "credential_use",
            Self::Budget => "budget",
            Self::SelfUpdate => "self_update",
            Self::ConnectionAct => "connection_act",
            Self::ConnectionManage => "connection_manage",
            Self::AutonomyThreshold => "autonomy_threshold",
            Self::Standing => "standing",
        }
    }
}

/// The human's verdict on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalVerdict {
    Approved,
    Declined,
    EditRequested,
    Conditional,
}

impl ApprovalVerdict {
    /// Wire/string form used in canonical payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Declined => "declined",
            Self::EditRequested => "edit_requested",
            Self::Conditional => "conditional",
        }
    }
}

/// A resolved decision, optionally carrying conditions
/// (`max_executions`, `spawn_policy_hash`, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub verdict: ApprovalVerdict,
    #[serde(default = "default_strength")]
    pub approval_strength: String,
    #[serde(default)]
    pub conditions: Map<String, Value>,
}

fn default_strength() -> String {
    "tap".to_owned()
}

impl ApprovalDecision {
    /// A plain decision with no conditions.
    pub fn new(verdict: ApprovalVerdict) -> Self {
        Self {
            verdict,
            approval_strength: default_strength(),
            conditions: Map::new(),
        }
    }
}

/// A signed authorization bound to one work item's plan hash.
///
/// The signature covers the canonical payload of every immutable field;
/// the execution counters (`executions_used`, `execution_nonces`) mutate
/// on each consuming verification and are deliberately outside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalToken {
    pub token_id: String,
    pub plan_hash: String,
    pub work_item_id: String,
    pub scope: ApprovalScope,
    pub verdict: ApprovalVerdict,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub nonce: String,
    #[serde(default = "default_strength")]
    pub approval_strength: String,
    #[serde(default)]
    pub conditions: Map<String, Value>,
    #[serde(default)]
    pub executions_used: u32,
    #[serde(default = "default_max_executions")]
    pub max_executions: u32,
    #[serde(default)]
    pub execution_nonces: Vec<String>,
}

fn default_max_executions() -> u32 {
    1
}

impl ApprovalToken {
    /// Validate construction-time invariants.
    ///
    /// `expires_at` must be after `issued_at`, and standing tokens must
    /// carry `conditions.spawn_policy_hash`.
    pub fn validate(&self) -> Result<(), ApprovalError> {
        if self.expires_at <= self.issued_at {
            return Err(ApprovalError::Invalid(
                "expires_at must be greater than issued_at".to_owned(),
            ));
        }
        if self.scope == ApprovalScope::Standing
            && !self.conditions.contains_key("spawn_policy_hash")
        {
            return Err(ApprovalError::Invalid(
                "standing approvals require conditions.spawn_policy_hash".to_owned(),
            ));
        }
        Ok(())
    }

    /// The spawn policy hash bound into a standing token, if present.
    pub fn spawn_policy_hash(&self) -> Option<&str> {
        self.conditions.get("spawn_policy_hash").and_then(Value::as_str)
    }

    /// Canonical bytes the Ed25519 signature covers.
    ///
    /// Sorted keys, compact separators, RFC 3339 timestamps with offset.
    /// Execution counters are excluded — they mutate after signing.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        canonical_token_bytes(
            &self.plan_hash,
            &self.work_item_id,
            self.scope,
            self.verdict,
            &self.nonce,
            &self.approval_strength,
            self.issued_at,
            self.expires_at,
            self.max_executions,
            &self.conditions,
        )
    }
}

/// Build the canonical signing payload for a token's immutable fields.
#[allow(clippy::too_many_arguments)]
pub(crate) fn canonical_token_bytes(
    plan_hash: &str,
    work_item_id: &str,
    scope: ApprovalScope,
    verdict: ApprovalVerdict,
    nonce: &str,
    approval_strength: &str,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    max_executions: u32,
    conditions: &Map<String, Value>,
) -> Vec<u8> {
    to_canonical_bytes(&json!({
        "plan_hash": plan_hash,
        "work_item_id": work_item_id,
        "scope": scope.as_str(),
        "verdict": verdict.as_str(),
        "nonce": nonce,
        "approval_strength": approval_strength,
        "issued_at": issued_at.to_rfc3339(),
        "expires_at": expires_at.to_rfc3339(),
        "max_executions": max_executions,
        "conditions": conditions,
    }))
}
