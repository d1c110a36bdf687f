//! Work-item execution: subtree resolution, dependency ordering, wave
//! scheduling, and per-item skill runs through the executor pool.
//!
//! Wave rules: independent items form one wide wave, linear chains form
//! single-item waves, diamonds collapse to an interior parallel wave.
//! Within a wave, dispatch order is ascending id for determinism; the
//! pool's conflict detection may still serialise members that share
//! artifact inputs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::item::{WorkItem, WorkItemResult, WorkItemStatus};
use super::store::WorkItemStore;
use crate::approval::ApprovalVerifier;
use crate::context::estimate_tokens;
use crate::exec::pool::{ExecutorPool, ItemExecutor};
use crate::skills::SkillExecutor;

/// Runs one work item: approval check, sequential skill runs, per-item
/// retry within the attempt budget, and store bookkeeping.
pub struct SingleItemRunner {
    skill_executor: SkillExecutor,
    store: WorkItemStore,
    verifier: Option<Arc<ApprovalVerifier>>,
}

impl SingleItemRunner {
    /// Bind the runner to its collaborators.
    pub fn new(
        skill_executor: SkillExecutor,
        store: WorkItemStore,
        verifier: Option<Arc<ApprovalVerifier>>,
    ) -> Self {
        Self {
            skill_executor,
            store,
            verifier,
        }
    }

    async fn run_single(&self, work_item: WorkItem) -> WorkItemResult {
        // Non-consuming token check: the consuming verify happened at
        // approval time; execution only asserts the token is good.
        if let (Some(verifier), Some(token)) = (&self.verifier, &work_item.approval_token) {
            let (ok, reason) = verifier.check(token, &work_item);
            if !ok {
                warn!(work_item_id = %work_item.id, reason, "approval check failed");
                let result = WorkItemResult::failed(
                    &work_item.id,
                    format!("Approval check failed for {}.", work_item.id),
                    reason,
                );
                self.persist(&work_item, &result).await;
                return result;
            }
        }

        let max_attempts = work_item.budget.max_attempts.max(1);
        let mut last_error: Option<String> = None;
        let mut tokens_used: u64 = 0;

        for attempt in 1..=max_attempts {
            let mut running = work_item.clone();
            running.status = WorkItemStatus::Running;
            running.attempts = attempt;
            if let Err(err) = self.store.save(&running).await {
                warn!(work_item_id = %work_item.id, error = %err, "failed to persist running state");
            }

            match self.run_skills(&work_item).await {
                Ok(attempt_tokens) => {
                    tokens_used = tokens_used.saturating_add(attempt_tokens);
                    let mut result =
                        WorkItemResult::done(&work_item.id, format!("Completed {}.", work_item.id));
                    result.budget_used.tokens = tokens_used;
                    result.budget_used.attempts = attempt;
                    result.budget_used.executor_runs = 1;
                    self.persist_with(&work_item, WorkItemStatus::Done, attempt, &result).await;
                    return result;
                }
                Err((error, attempt_tokens)) => {
                    tokens_used = tokens_used.saturating_add(attempt_tokens);
                    last_error = Some(error);
                }
            }
        }

        let error = last_error.unwrap_or_else(|| "execution failed".to_owned());
        let mut result = WorkItemResult::failed(
            &work_item.id,
            format!("Failed {}.", work_item.id),
            error,
        );
        result.budget_used.tokens = tokens_used;
        result.budget_used.attempts = max_attempts;
        result.budget_used.executor_runs = 1;
        self.persist_with(&work_item, WorkItemStatus::Failed, max_attempts, &result).await;
        result
    }

    /// Run the item's declared skills sequentially.
    ///
    /// Returns the token estimate on success, or `(error, tokens)` at
    /// the first failed skill.
    async fn run_skills(&self, work_item: &WorkItem) -> Result<u64, (String, u64)> {
        let mut tokens: u64 = 0;
        for skill_name in &work_item.skills {
            let inputs = json!({
                "work_item_id": work_item.id,
                "title": work_item.title,
                "body": work_item.body,
            });
            let result = self
                .skill_executor
                .execute(skill_name, inputs, Some(work_item))
                .await;

            let output_text = result.output.to_string();
            tokens = tokens.saturating_add(estimate_tokens(&output_text));

            if !result.success {
                let error = result
                    .error
                    .unwrap_or_else(|| format!("skill '{skill_name}' failed"));
                return Err((error, tokens));
            }
        }
        Ok(tokens)
    }

    async fn persist(&self, work_item: &WorkItem, result: &WorkItemResult) {
        self.persist_with(work_item, result.status, result.budget_used.attempts, result)
            .await;
    }

    async fn persist_with(
        &self,
        work_item: &WorkItem,
        status: WorkItemStatus,
        attempts: u32,
        result: &WorkItemResult,
    ) {
        let mut stored = work_item.clone();
        stored.status = status;
        stored.attempts = attempts;
        stored.budget_used = result.budget_used.clone();
        if let Err(err) = self.store.save(&stored).await {
            warn!(work_item_id = %work_item.id, error = %err, "failed to persist terminal state");
        }
    }
}

#[async_trait]
impl ItemExecutor for SingleItemRunner {
    async fn execute(&self, work_item: WorkItem) -> WorkItemResult {
        self.run_single(work_item).await
    }
}

/// Executes a work item and its subtree through the pool.
pub struct WorkItemExecutor {
    store: WorkItemStore,
    pool: ExecutorPool,
}

impl WorkItemExecutor {
    /// Build the executor with default pool caps.
    pub fn new(
        skill_executor: SkillExecutor,
        store: WorkItemStore,
        verifier: Option<Arc<ApprovalVerifier>>,
    ) -> Self {
        let runner = SingleItemRunner::new(skill_executor, store.clone(), verifier);
        Self {
            store,
            pool: ExecutorPool::new(Arc::new(runner)),
        }
    }

    /// Build the executor with explicit pool caps.
    pub fn with_limits(
        skill_executor: SkillExecutor,
        store: WorkItemStore,
        verifier: Option<Arc<ApprovalVerifier>>,
        max_concurrent: usize,
        max_concurrent_global: usize,
    ) -> Self {
        let runner = SingleItemRunner::new(skill_executor, store.clone(), verifier);
        Self {
            store,
            pool: ExecutorPool::with_limits(Arc::new(runner), max_concurrent, max_concurrent_global),
        }
    }

    /// The underlying pool (cancellation surface).
    pub fn pool(&self) -> &ExecutorPool {
        &self.pool
    }

    /// Execute a work item and its subtree in the `owner` scope.
    pub async fn execute(&self, work_item: WorkItem) -> WorkItemResult {
        self.execute_in_scope(work_item, "owner").await
    }

    /// Execute a work item and its subtree in a scope.
    pub async fn execute_in_scope(&self, work_item: WorkItem, scope_id: &str) -> WorkItemResult {
        let root_id = work_item.id.clone();

        let subtree = match self.resolve_subtree(work_item.clone()).await {
            Ok(subtree) => subtree,
            Err(error) => {
                let result = WorkItemResult::failed(
                    &root_id,
                    format!("Could not resolve subtree for {root_id}."),
                    &error,
                );
                self.mark_failed(&work_item, &error).await;
                return result;
            }
        };

        // Done dependencies are satisfied without re-execution; failed
        // ones abort the subtree before anything runs.
        let mut satisfied: HashSet<String> = HashSet::new();
        for item in subtree.values() {
            match item.status {
                WorkItemStatus::Done => {
                    satisfied.insert(item.id.clone());
                }
                WorkItemStatus::Failed if item.id != root_id => {
                    let error = format!("dependency {} failed", item.id);
                    self.mark_failed(&work_item, &error).await;
                    return WorkItemResult::failed(
                        &root_id,
                        format!("Subtree of {root_id} blocked by failed dependency."),
                        error,
                    );
                }
                _ => {}
            }
        }

        let runnable: BTreeMap<String, WorkItem> = subtree
            .into_iter()
            .filter(|(id, _)| !satisfied.contains(id))
            .collect();

        let waves = match schedule_waves(&runnable, &satisfied) {
            Ok(waves) => waves,
            Err(error) => {
                self.mark_failed(&work_item, &error).await;
                return WorkItemResult::failed(
                    &root_id,
                    format!("Could not order subtree for {root_id}."),
                    error,
                );
            }
        };

        let mut merged = crate::work::item::BudgetUsed::default();
        let mut root_result: Option<WorkItemResult> = None;

        'waves: for wave in waves {
            let items: Vec<WorkItem> = wave
                .iter()
                .filter_map(|id| runnable.get(id).cloned())
                .collect();
            info!(
                scope_id,
                wave_size = items.len(),
                ids = ?wave,
                "dispatching wave"
            );
            let results = self.pool.dispatch_parallel(items, scope_id).await;

            for result in results {
                merged.merge(&result.budget_used);
                let failed = result.status != WorkItemStatus::Done;
                let is_root = result.work_item_id == root_id;
                if is_root {
                    root_result = Some(result);
                } else if failed {
                    // A failed member blocks everything downstream.
                    let error = format!(
                        "dependency {} failed: {}",
                        result.work_item_id,
                        result.last_error.as_deref().unwrap_or("unknown error"),
                    );
                    self.mark_failed(&work_item, &error).await;
                    root_result = Some(WorkItemResult::failed(
                        &root_id,
                        format!("Subtree of {root_id} stopped at failed member."),
                        error,
                    ));
                    break 'waves;
                }
                if is_root && failed {
                    break 'waves;
                }
            }
        }

        let mut result = root_result.unwrap_or_else(|| {
            // Root was already done before execution started.
            WorkItemResult::done(&root_id, format!("Completed {root_id}."))
        });
        result.budget_used = merged;
        result
    }

    /// Load the transitive subtree: `tasks[]` recursively, plus every
    /// `depends_on` referent, all resolved from the store.
    async fn resolve_subtree(
        &self,
        root: WorkItem,
    ) -> Result<BTreeMap<String, WorkItem>, String> {
        let mut items: BTreeMap<String, WorkItem> = BTreeMap::new();
        let mut to_visit: Vec<String> = Vec::new();

        to_visit.extend(root.tasks.iter().cloned());
        to_visit.extend(root.depends_on.iter().cloned());
        items.insert(root.id.clone(), root);

        while let Some(id) = to_visit.pop() {
            if items.contains_key(&id) {
                continue;
            }
            let item = self
                .store
                .get(&id)
                .await
                .map_err(|e| format!("store error resolving {id}: {e}"))?
                .ok_or_else(|| format!("missing dependency {id}"))?;
            to_visit.extend(item.tasks.iter().cloned());
            to_visit.extend(item.depends_on.iter().cloned());
            items.insert(id, item);
        }
        Ok(items)
    }

    async fn mark_failed(&self, work_item: &WorkItem, _error: &str) {
        let mut failed = work_item.clone();
        failed.status = WorkItemStatus::Failed;
        if let Err(err) = self.store.save(&failed).await {
            warn!(work_item_id = %work_item.id, error = %err, "failed to persist failure");
        }
    }
}

/// Effective ordering dependencies: explicit `depends_on` plus direct
/// children (a parent starts only after its `tasks[]` complete).
fn effective_deps(item: &WorkItem) -> impl Iterator<Item = &String> {
    item.depends_on.iter().chain(item.tasks.iter())
}

/// Partition items into dependency waves.
///
/// Wave k holds items whose unsatisfied dependencies all sit in earlier
/// waves. Cycles are a scheduling error naming the unresolved ids.
fn schedule_waves(
    items: &BTreeMap<String, WorkItem>,
    satisfied: &HashSet<String>,
) -> Result<Vec<Vec<String>>, String> {
    let mut remaining: HashMap<&str, HashSet<&str>> = items
        .iter()
        .map(|(id, item)| {
            let deps: HashSet<&str> = effective_deps(item)
                .map(String::as_str)
                .filter(|dep| items.contains_key(*dep) && !satisfied.contains(*dep))
                .collect();
            (id.as_str(), deps)
        })
        .collect();

    let mut waves: Vec<Vec<String>> = Vec::new();
    while !remaining.is_empty() {
        // BTreeMap iteration gives ascending-id order inside the wave.
        let mut ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| *id)
            .collect();
        ready.sort_unstable();

        if ready.is_empty() {
            let mut unresolved: Vec<&str> = remaining.keys().copied().collect();
            unresolved.sort_unstable();
            return Err(format!("circular dependency: {}", unresolved.join(" -> ")));
        }

        for id in &ready {
            remaining.remove(id);
        }
        for deps in remaining.values_mut() {
            for id in &ready {
                deps.remove(id);
            }
        }
        waves.push(ready.into_iter().map(str::to_owned).collect());
    }
    Ok(waves)
}
