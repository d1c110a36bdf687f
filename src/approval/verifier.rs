//! Ed25519-backed approval token issuer and verifier.
//!
//! Binds approvals to immutable plan content and enforces replay-safe
//! consumption: every successful [`ApprovalVerifier::verify`] records a
//! fresh execution nonce in the nonce store keyed by
//! `{token_id}:{bound_plan_hash}:{execution_nonce}` under domain `exec`.

use chrono::{Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::approval::token::{
    canonical_token_bytes, ApprovalDecision, ApprovalScope, ApprovalToken,
};
use crate::persistence::NonceStore;
use crate::work::WorkItem;

/// Nonce-store domain for execution nonces.
const EXEC_DOMAIN: &str = "exec";

/// Default token lifetime.
const TOKEN_TTL_HOURS: i64 = 1;

/// Issues and verifies approval tokens against work-item plan hashes.
pub struct ApprovalVerifier {
    signing_key: SigningKey,
    public_key: VerifyingKey,
    nonce_store: NonceStore,
}

impl ApprovalVerifier {
    /// Keep signing material local so only canonical payloads minted
    /// here can authorize execution.
    pub fn new(signing_key: SigningKey, nonce_store: NonceStore) -> Self {
        let public_key = signing_key.verifying_key();
        Self {
            signing_key,
            public_key,
            nonce_store,
        }
    }

    /// Generate a verifier with a fresh random keypair.
    pub fn generate(nonce_store: NonceStore) -> Self {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        Self::new(signing_key, nonce_store)
    }

    /// The public half of the signing keypair.
    pub fn public_key(&self) -> &VerifyingKey {
        &self.public_key
    }

    /// Mint a signed token for a decision on `work_item`.
    ///
    /// `max_executions` comes from `decision.conditions.max_executions`
    /// (default 1; boolean values coerce to 1). Standing scope
    /// auto-injects `spawn_policy_hash = work_item.plan_hash()` when the
    /// decision didn't bind one explicitly.
    pub fn issue_token(
        &self,
        work_item: &WorkItem,
        decision: &ApprovalDecision,
        scope: ApprovalScope,
    ) -> ApprovalToken {
        let plan_hash = work_item.plan_hash();
        let token_id = Uuid::new_v4().simple().to_string();
        let nonce = Uuid::new_v4().simple().to_string();
        let issued_at = Utc::now();
        let expires_at = issued_at + Duration::hours(TOKEN_TTL_HOURS);
        let max_executions = resolve_max_executions(&decision.conditions);
        let conditions = resolve_conditions(&plan_hash, scope, &decision.conditions);

        let canonical = canonical_token_bytes(
            &plan_hash,
            &work_item.id,
            scope,
            decision.verdict,
            &nonce,
            &decision.approval_strength,
            issued_at,
            expires_at,
            max_executions,
            &conditions,
        );
        let signature: Signature = self.signing_key.sign(&canonical);

        ApprovalToken {
            token_id,
            plan_hash,
            work_item_id: work_item.id.clone(),
            scope,
            verdict: decision.verdict,
            signature: signature.to_bytes().to_vec(),
            issued_at,
            expires_at,
            nonce,
            approval_strength: decision.approval_strength.clone(),
            conditions,
            executions_used: 0,
            max_executions,
            execution_nonces: Vec::new(),
        }
    }

    /// Consuming verification: each success is single-use tracked.
    ///
    /// Returns `(true, "ok")` on success; on failure, `(false, reason)`
    /// with one of `invalid_signature`, `plan_hash_mismatch`,
    /// `token_expired`, `execution_limit_reached`,
    /// `standing_requires_spawned_task`, `standing_parent_mismatch`,
    /// `standing_policy_mismatch`, `execution_nonce_replay`.
    ///
    /// The execution nonce is generated here rather than signed into the
    /// token: a token whose `execution_nonces` is still empty is
    /// consumable by whichever holder verifies first. Binding in the
    /// nonce store closes the replay window from then on.
    pub async fn verify(
        &self,
        token: &mut ApprovalToken,
        work_item: &WorkItem,
        spawned_task: Option<&WorkItem>,
    ) -> Result<(bool, &'static str), sqlx::Error> {
        if !self.signature_is_valid(token) {
            return Ok((false, "invalid_signature"));
        }

        let current_plan_hash = work_item.plan_hash();
        if token.plan_hash != current_plan_hash {
            return Ok((false, "plan_hash_mismatch"));
        }

        if Utc::now() >= token.expires_at {
            return Ok((false, "token_expired"));
        }

        if token.executions_used >= token.max_executions {
            return Ok((false, "execution_limit_reached"));
        }

        let bound_plan_hash = match (token.scope, spawned_task) {
            (ApprovalScope::Standing, None) => {
                return Ok((false, "standing_requires_spawned_task"));
            }
            (ApprovalScope::Standing, Some(spawned)) => {
                if spawned.parent.as_deref() != Some(token.work_item_id.as_str()) {
                    return Ok((false, "standing_parent_mismatch"));
                }
                let spawned_hash = spawned.plan_hash();
                match token.spawn_policy_hash() {
                    Some(policy) if policy_hash_matches(policy, &spawned_hash) => {}
                    _ => return Ok((false, "standing_policy_mismatch")),
                }
                spawned_hash
            }
            (_, _) => current_plan_hash,
        };

        let execution_nonce = Uuid::new_v4().simple().to_string();
        // Replay protection binds token + plan context, not raw nonce bytes.
        let binding_key = format!("{}:{}:{}", token.token_id, bound_plan_hash, execution_nonce);
        if self.nonce_store.is_used(EXEC_DOMAIN, &binding_key).await? {
            return Ok((false, "execution_nonce_replay"));
        }
        if !self.nonce_store.record(EXEC_DOMAIN, &binding_key).await? {
            // Lost the insert race: someone consumed this exact binding.
            warn!(token_id = %token.token_id, "execution nonce insert race");
            return Ok((false, "execution_nonce_replay"));
        }

        token.execution_nonces.push(execution_nonce);
        token.executions_used = token.executions_used.saturating_add(1);
        Ok((true, "ok"))
    }

    /// Replay a previously recorded execution nonce against the store.
    ///
    /// Used by tests and integrity checks to assert a consumed binding
    /// exists; a second consumption of the same nonce is a replay.
    pub async fn consume_recorded_nonce(
        &self,
        token: &ApprovalToken,
        bound_plan_hash: &str,
        execution_nonce: &str,
    ) -> Result<(bool, &'static str), sqlx::Error> {
        let binding_key = format!("{}:{}:{}", token.token_id, bound_plan_hash, execution_nonce);
        if self.nonce_store.is_used(EXEC_DOMAIN, &binding_key).await? {
            return Ok((false, "execution_nonce_replay"));
        }
        self.nonce_store.record(EXEC_DOMAIN, &binding_key).await?;
        Ok((true, "ok"))
    }

    /// Non-consuming check of an already-consumed token.
    ///
    /// Used by executors before running work: the token must have been
    /// consumed at least once and not beyond its limit. Standing tokens
    /// bind via the parent relation instead of the direct plan hash.
    pub fn check(&self, token: &ApprovalToken, work_item: &WorkItem) -> (bool, &'static str) {
        if !self.signature_is_valid(token) {
            return (false, "invalid_signature");
        }

        if token.scope == ApprovalScope::Standing {
            if work_item.parent.as_deref() != Some(token.work_item_id.as_str()) {
                return (false, "standing_parent_mismatch");
            }
        } else if token.plan_hash != work_item.plan_hash() {
            return (false, "plan_hash_mismatch");
        }

        if Utc::now() >= token.expires_at {
            return (false, "token_expired");
        }

        if token.executions_used < 1 {
            return (false, "token_not_consumed");
        }
        if token.executions_used > token.max_executions {
            return (false, "execution_limit_exceeded");
        }
        (true, "ok")
    }

    fn signature_is_valid(&self, token: &ApprovalToken) -> bool {
        let bytes: [u8; 64] = match token.signature.as_slice().try_into() {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let signature = Signature::from_bytes(&bytes);
        self.public_key
            .verify(&token.canonical_bytes(), &signature)
            .is_ok()
    }
}

/// Normalized comparison of spawn policy hashes (lowercase hex on both
/// sides — callers must all route through here).
pub(crate) fn policy_hash_matches(policy: &str, plan_hash: &str) -> bool {
    policy.to_ascii_lowercase() == plan_hash.to_ascii_lowercase()
}

fn resolve_max_executions(conditions: &Map<String, Value>) -> u32 {
    match conditions.get("max_executions") {
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(n)) => match n.as_u64() {
            Some(v) if v > 0 => u32::try_from(v).unwrap_or(u32::MAX),
            _ => 1,
        },
        _ => 1,
    }
}

fn resolve_conditions(
    plan_hash: &str,
    scope: ApprovalScope,
    decision_conditions: &Map<String, Value>,
) -> Map<String, Value> {
    let mut conditions = decision_conditions.clone();
    if scope == ApprovalScope::Standing && !conditions.contains_key("spawn_policy_hash") {
        conditions.insert("spawn_policy_hash".to_owned(), Value::String(plan_hash.to_owned()));
    }
    conditions
}
