//! Cross-module security invariants: token lifecycle, plan-hash
//! binding, replay defense, audit chain integrity, and the memory
//! taint gates.

use serde_json::json;

use straylight::approval::{
    ApprovalDecision, ApprovalScope, ApprovalVerdict, ApprovalVerifier,
};
use straylight::audit::AuditLog;
use straylight::gates::{TaintTracker, ToolTaintRegistry};
use straylight::memory::{
    filter_for_taint, MemoryItem, MemoryOp, MemoryOpKind, MemoryOps, MemoryStore, MemoryType,
};
use straylight::persistence::{open_in_memory, NonceStore};
use straylight::types::TaintLevel;
use straylight::work::WorkItem;

async fn verifier() -> ApprovalVerifier {
    let pool = open_in_memory().await.expect("pool");
    let nonces = NonceStore::new(pool);
    nonces.initialize().await.expect("initialize");
    ApprovalVerifier::generate(nonces)
}

fn approved() -> ApprovalDecision {
    ApprovalDecision::new(ApprovalVerdict::Approved)
}

// ── S1: single-use token ────────────────────────────────────────────

#[tokio::test]
async fn single_use_token_allows_exactly_one_verify() {
    let verifier = verifier().await;
    let item = WorkItem::task("wi1", "t", "X");
    let mut token = verifier.issue_token(&item, &approved(), ApprovalScope::FullPlan);
    assert_eq!(token.max_executions, 1);

    let (ok, reason) = verifier.verify(&mut token, &item, None).await.expect("verify");
    assert!(ok);
    assert_eq!(reason, "ok");

    let (ok, reason) = verifier.verify(&mut token, &item, None).await.expect("verify");
    assert!(!ok);
    assert_eq!(reason, "execution_limit_reached");
}

#[tokio::test]
async fn n_use_token_allows_exactly_n_verifies() {
    let verifier = verifier().await;
    let item = WorkItem::task("wi-n", "t", "X");
    let mut decision = approved();
    decision.conditions.insert("max_executions".to_owned(), json!(4));
    let mut token = verifier.issue_token(&item, &decision, ApprovalScope::FullPlan);

    for n in 1..=4u32 {
        let (ok, reason) = verifier.verify(&mut token, &item, None).await.expect("verify");
        assert!(ok, "verify {n} should pass: {reason}");
    }
    let (ok, reason) = verifier.verify(&mut token, &item, None).await.expect("verify");
    assert!(!ok);
    assert_eq!(reason, "execution_limit_reached");
}

// ── S2: plan tamper ─────────────────────────────────────────────────

#[tokio::test]
async fn mutated_plan_fails_hash_binding() {
    let verifier = verifier().await;
    let original = WorkItem::task("wi2", "t", "A");
    let mut token = verifier.issue_token(&original, &approved(), ApprovalScope::FullPlan);

    let mutated = WorkItem::task("wi2", "t", "B");
    let (ok, reason) = verifier
        .verify(&mut token, &mutated, None)
        .await
        .expect("verify");
    assert!(!ok);
    assert_eq!(reason, "plan_hash_mismatch");
}

#[tokio::test]
async fn signature_covers_every_field() {
    let verifier = verifier().await;
    let item = WorkItem::task("wi-sig", "t", "A");
    let baseline = verifier.issue_token(&item, &approved(), ApprovalScope::FullPlan);

    // Tamper each signed field in turn; all must fail signature check.
    let mut tampered_hash = baseline.clone();
    tampered_hash.plan_hash = "00".repeat(32);
    let mut tampered_nonce = baseline.clone();
    tampered_nonce.nonce = "different".to_owned();
    let mut tampered_max = baseline.clone();
    tampered_max.max_executions = 99;
    let mut tampered_conditions = baseline;
    tampered_conditions
        .conditions
        .insert("injected".to_owned(), json!(true));

    for mut token in [
        tampered_hash,
        tampered_nonce,
        tampered_max,
        tampered_conditions,
    ] {
        let (ok, reason) = verifier.verify(&mut token, &item, None).await.expect("verify");
        assert!(!ok);
        assert_eq!(reason, "invalid_signature");
    }
}

// ── Replay defense ──────────────────────────────────────────────────

#[tokio::test]
async fn consumed_execution_nonce_cannot_be_reused() {
    let verifier = verifier().await;
    let item = WorkItem::task("wi-replay", "t", "X");
    let mut token = verifier.issue_token(&item, &approved(), ApprovalScope::FullPlan);

    let (ok, _) = verifier.verify(&mut token, &item, None).await.expect("verify");
    assert!(ok);
    let nonce = token.execution_nonces[0].clone();

    let (ok, reason) = verifier
        .consume_recorded_nonce(&token, &item.plan_hash(), &nonce)
        .await
        .expect("replay check");
    assert!(!ok);
    assert_eq!(reason, "execution_nonce_replay");
}

#[tokio::test]
async fn token_roundtrip_preserves_signature_and_counters() {
    let verifier = verifier().await;
    let item = WorkItem::task("wi-rt", "t", "X");
    let mut token = verifier.issue_token(&item, &approved(), ApprovalScope::FullPlan);
    let (ok, _) = verifier.verify(&mut token, &item, None).await.expect("verify");
    assert!(ok);

    let json = serde_json::to_string(&token).expect("serialize");
    let restored: straylight::approval::ApprovalToken =
        serde_json::from_str(&json).expect("deserialize");
    assert_eq!(restored.signature, token.signature);
    assert_eq!(restored.executions_used, 1);
    assert_eq!(restored.execution_nonces, token.execution_nonces);

    // The restored token still checks (non-consuming path).
    let (ok, reason) = verifier.check(&restored, &item);
    assert!(ok, "restored token must check: {reason}");
}

// ── Taint monotonicity ──────────────────────────────────────────────

#[test]
fn taint_never_decreases_until_reset() {
    let mut tracker = TaintTracker::new(ToolTaintRegistry::new());
    let mut high_water = TaintLevel::Owner;

    tracker.on_tool_input(TaintLevel::Auth);
    for tool in ["memory_recall", "web_search", "calendar_read", "memory_recall"] {
        let taint = tracker.on_tool_output(tool);
        assert!(taint >= high_water);
        high_water = taint;
    }
    assert_eq!(tracker.current(), TaintLevel::External);

    tracker.reset();
    assert_eq!(tracker.current(), TaintLevel::Owner);
}

// ── Memory cross-taint and write gates ──────────────────────────────

async fn memory_fixtures() -> (MemoryStore, AuditLog) {
    let pool = open_in_memory().await.expect("pool");
    let store = MemoryStore::new(pool.clone());
    store.initialize().await.expect("init store");
    let audit = AuditLog::new(pool);
    audit.initialize().await.expect("init audit");
    (store, audit)
}

#[tokio::test]
async fn external_request_never_sees_owner_memories() {
    let (store, _) = memory_fixtures().await;

    let mut owner = MemoryItem::new("m-owner", "private plans", MemoryType::Fact, "test");
    owner.taint = TaintLevel::Owner;
    let mut auth = MemoryItem::new("m-auth", "private plans", MemoryType::Fact, "test");
    auth.taint = TaintLevel::Auth;
    store.store(&owner).await.expect("store");
    store.store(&auth).await.expect("store");

    let retrieved = store
        .search_keyword("private plans", 10, None)
        .await
        .expect("search");
    assert_eq!(retrieved.len(), 2);

    let gated = filter_for_taint(retrieved, TaintLevel::External);
    assert_eq!(gated.len(), 1);
    assert!(gated.iter().all(|m| m.taint != TaintLevel::Owner));
}

#[tokio::test]
async fn external_turn_creates_no_agent_memories() {
    let (store, audit) = memory_fixtures().await;
    let ops = MemoryOps::new(&store, &audit, 10);

    let requested = vec![MemoryOp {
        op: MemoryOpKind::Store,
        memory_id: None,
        content: Some("attacker instructions".to_owned()),
        memory_type: Some(MemoryType::Fact),
        tags: Vec::new(),
        entity_refs: Vec::new(),
        link_to: None,
    }];
    let executed = ops
        .process(&requested, TaintLevel::External, "owner", "s1", 1)
        .await
        .expect("process");
    assert_eq!(executed, 0);

    // Nothing with agent provenance exists anywhere in the store.
    let recent = store.list_recent(100).await.expect("list");
    assert!(recent.iter().all(|m| m.source_kind != "agent_memory_op"));

    // The raw lane still ingests the inbound text, tainted as it came.
    let raw_id = ops
        .ingest_raw("attacker instructions", TaintLevel::External, "owner", "s1", 1)
        .await
        .expect("ingest");
    let raw = store.get(&raw_id).await.expect("get").expect("present");
    assert_eq!(raw.source_kind, "conversation_raw");
    assert_eq!(raw.taint, TaintLevel::External);
}

// ── Audit chain ─────────────────────────────────────────────────────

#[tokio::test]
async fn audit_chain_detects_any_data_mutation() {
    let pool = open_in_memory().await.expect("pool");
    let audit = AuditLog::new(pool.clone());
    audit.initialize().await.expect("initialize");

    for i in 0..4 {
        audit
            .log("kernel_event", json!({"sequence": i}))
            .await
            .expect("log");
    }
    assert_eq!(audit.verify_chain().await.expect("verify"), (true, 4));

    sqlx::query("UPDATE audit_log SET data = '{\"sequence\":99}' WHERE rowid = 2")
        .execute(&pool)
        .await
        .expect("tamper");
    assert_eq!(audit.verify_chain().await.expect("verify"), (false, 0));
}

#[tokio::test]
async fn checkpoint_scopes_tamper_detection() {
    let pool = open_in_memory().await.expect("pool");
    let audit = AuditLog::new(pool.clone());
    audit.initialize().await.expect("initialize");

    audit.log("a", json!({"v": 1})).await.expect("log");
    let b = audit.log("b", json!({"v": 2})).await.expect("log");
    let checkpoint = audit.write_checkpoint().await.expect("checkpoint");
    let c = audit.log("c", json!({"v": 3})).await.expect("log");

    // B precedes the checkpoint: invisible to checkpoint verification.
    sqlx::query("UPDATE audit_log SET data = '{\"v\":99}' WHERE entry_id = ?1")
        .bind(&b)
        .execute(&pool)
        .await
        .expect("tamper b");
    let (ok, count) = audit
        .verify_from_checkpoint(Some(&checkpoint))
        .await
        .expect("verify");
    assert!(ok);
    assert!(count >= 1);

    // C is at-or-after the checkpoint: caught.
    sqlx::query("UPDATE audit_log SET data = '{\"v\":98}' WHERE entry_id = ?1")
        .bind(&c)
        .execute(&pool)
        .await
        .expect("tamper c");
    assert_eq!(
        audit
            .verify_from_checkpoint(Some(&checkpoint))
            .await
            .expect("verify"),
        (false, 0)
    );
}

// ── Plan hash stability ─────────────────────────────────────────────

#[test]
fn equivalent_work_items_hash_identically() {
    let mut a = WorkItem::task("wi-hash", "Title", "Body");
    a.skills = vec!["web_search".to_owned()];
    let mut b = WorkItem::task("wi-hash", "Title", "Body");
    b.skills = vec!["web_search".to_owned()];

    // Mutable execution state must not influence the hash.
    b.status = straylight::work::WorkItemStatus::Running;
    b.attempts = 7;
    b.budget_used.tokens = 12_345;

    assert_eq!(a.plan_hash(), b.plan_hash());
    assert_eq!(a.plan_hash_bytes(), b.plan_hash_bytes());
}
