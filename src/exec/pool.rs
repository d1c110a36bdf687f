//! Concurrency-capped executor pool for parallel work-item dispatch.
//!
//! Two limits bound concurrent work: a per-scope semaphore and a global
//! semaphore. Acquisition order is always global first, then scope —
//! one consistent order across every code path, so two dispatches can
//! never hold one semaphore each while waiting on the other. Conflict
//! detection serialises items whose artifact inputs overlap; it is
//! conservative on purpose — a false positive costs parallelism, a
//! false negative corrupts data.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{info, warn};

use crate::work::{WorkItem, WorkItemResult};

/// Default per-scope concurrency cap.
const DEFAULT_MAX_CONCURRENT: usize = 8;

/// Default global concurrency cap.
const DEFAULT_MAX_CONCURRENT_GLOBAL: usize = 16;

/// Executes a single work item. The pool wraps this with concurrency
/// caps and cancellation.
#[async_trait]
pub trait ItemExecutor: Send + Sync + 'static {
    /// Run one work item to a terminal result.
    async fn execute(&self, work_item: WorkItem) -> WorkItemResult;
}

struct PoolState {
    global: Arc<Semaphore>,
    scope_semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    in_flight: Mutex<HashMap<String, AbortHandle>>,
    max_concurrent: usize,
}

/// Async executor pool with per-scope and global concurrency caps.
#[derive(Clone)]
pub struct ExecutorPool {
    executor: Arc<dyn ItemExecutor>,
    state: Arc<PoolState>,
}

impl ExecutorPool {
    /// Wrap an executor with the default caps (8 per scope, 16 global).
    pub fn new(executor: Arc<dyn ItemExecutor>) -> Self {
        Self::with_limits(executor, DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_CONCURRENT_GLOBAL)
    }

    /// Wrap an executor with explicit caps (each clamped to ≥ 1).
    pub fn with_limits(
        executor: Arc<dyn ItemExecutor>,
        max_concurrent: usize,
        max_concurrent_global: usize,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            executor,
            state: Arc::new(PoolState {
                global: Arc::new(Semaphore::new(max_concurrent_global.max(1))),
                scope_semaphores: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                max_concurrent,
            }),
        }
    }

    /// Dispatch a work item, respecting both concurrency caps.
    ///
    /// Blocks until permits are free, then runs the item as an
    /// abortable task. Cancellation yields a failed result with
    /// `last_error = "cancelled"`; a panicking executor yields a failed
    /// result carrying the panic text.
    pub async fn dispatch(&self, work_item: WorkItem, scope_id: &str) -> WorkItemResult {
        let scope_sem = self.scope_semaphore(scope_id).await;

        // Global first, then scope.
        let Ok(_global_permit) = self.state.global.clone().acquire_owned().await else {
            return WorkItemResult::failed(&work_item.id, "executor pool closed", "pool_closed");
        };
        let Ok(_scope_permit) = scope_sem.acquire_owned().await else {
            return WorkItemResult::failed(&work_item.id, "executor pool closed", "pool_closed");
        };

        let item_id = work_item.id.clone();
        info!(scope_id, work_item_id = %item_id, "executor_pool_dispatch");

        let executor = self.executor.clone();
        let handle = tokio::spawn(async move { executor.execute(work_item).await });
        self.state
            .in_flight
            .lock()
            .await
            .insert(item_id.clone(), handle.abort_handle());

        let outcome = handle.await;
        self.state.in_flight.lock().await.remove(&item_id);

        match outcome {
            Ok(result) => result,
            Err(join_error) if join_error.is_cancelled() => {
                warn!(scope_id, work_item_id = %item_id, "executor_pool_cancelled");
                WorkItemResult::failed(
                    &item_id,
                    format!("Work item {item_id} cancelled."),
                    "cancelled",
                )
            }
            Err(join_error) => {
                warn!(scope_id, work_item_id = %item_id, error = %join_error, "executor_pool_error");
                WorkItemResult::failed(
                    &item_id,
                    format!("Work item {item_id} failed with error."),
                    join_error.to_string(),
                )
            }
        }
    }

    /// Dispatch several items, serialising conflicting ones.
    ///
    /// Items whose `input_artifacts_from` sets overlap run strictly one
    /// after another; everything else shares one parallel group.
    /// Results come back in input order.
    pub async fn dispatch_parallel(
        &self,
        work_items: Vec<WorkItem>,
        scope_id: &str,
    ) -> Vec<WorkItemResult> {
        let input_order: Vec<String> = work_items.iter().map(|i| i.id.clone()).collect();
        let groups = detect_conflicts(work_items);
        let mut results: HashMap<String, WorkItemResult> = HashMap::new();

        for group in groups {
            if group.len() == 1 {
                let mut group = group;
                let Some(item) = group.pop() else { continue };
                let id = item.id.clone();
                let result = self.dispatch(item, scope_id).await;
                results.insert(id, result);
            } else {
                let mut set = JoinSet::new();
                for item in group {
                    let pool = self.clone();
                    let scope = scope_id.to_owned();
                    set.spawn(async move {
                        let id = item.id.clone();
                        let result = pool.dispatch(item, &scope).await;
                        (id, result)
                    });
                }
                while let Some(joined) = set.join_next().await {
                    match joined {
                        Ok((id, result)) => {
                            results.insert(id, result);
                        }
                        Err(join_error) => {
                            warn!(error = %join_error, "dispatch_parallel task failed");
                        }
                    }
                }
            }
        }

        input_order
            .into_iter()
            .map(|id| {
                results.remove(&id).unwrap_or_else(|| {
                    WorkItemResult::failed(&id, "dispatch lost", "dispatch_lost")
                })
            })
            .collect()
    }

    /// Cancel an in-flight item by id. Returns whether a cancellation
    /// was sent (false if it already finished or was never dispatched).
    pub async fn cancel(&self, work_item_id: &str) -> bool {
        let in_flight = self.state.in_flight.lock().await;
        let Some(handle) = in_flight.get(work_item_id) else {
            return false;
        };
        handle.abort();
        info!(work_item_id, "executor_pool_cancel_requested");
        true
    }

    /// Number of currently executing items.
    pub async fn in_flight_count(&self) -> usize {
        self.state.in_flight.lock().await.len()
    }

    async fn scope_semaphore(&self, scope_id: &str) -> Arc<Semaphore> {
        let mut semaphores = self.state.scope_semaphores.lock().await;
        semaphores
            .entry(scope_id.to_owned())
            .or_insert_with(|| Arc::new(Semaphore::new(self.state.max_concurrent)))
            .clone()
    }
}

/// Group work items by artifact-input overlap.
///
/// Conflicting items each get their own single-item (serial) group;
/// non-conflicting items share one parallel group.
fn detect_conflicts(work_items: Vec<WorkItem>) -> Vec<Vec<WorkItem>> {
    if work_items.len() <= 1 {
        return if work_items.is_empty() {
            Vec::new()
        } else {
            vec![work_items]
        };
    }

    let artifact_sets: Vec<std::collections::HashSet<&str>> = work_items
        .iter()
        .map(|item| item.input_artifacts_from.iter().map(String::as_str).collect())
        .collect();

    let mut conflicting = vec![false; work_items.len()];
    for i in 0..work_items.len() {
        for j in i.saturating_add(1)..work_items.len() {
            if !artifact_sets[i].is_disjoint(&artifact_sets[j]) {
                conflicting[i] = true;
                conflicting[j] = true;
            }
        }
    }

    let mut parallel_group: Vec<WorkItem> = Vec::new();
    let mut serial_groups: Vec<Vec<WorkItem>> = Vec::new();
    for (item, is_conflicting) in work_items.into_iter().zip(conflicting) {
        if is_conflicting {
            serial_groups.push(vec![item]);
        } else {
            parallel_group.push(item);
        }
    }

    let mut groups = Vec::new();
    if !parallel_group.is_empty() {
        groups.push(parallel_group);
    }
    groups.extend(serial_groups);
    groups
}

/// Dispatch priority: approved executions before research before
/// status-style goal chatter. Lower sorts first.
pub fn priority_key(work_item: &WorkItem) -> u8 {
    if work_item.approval_token.is_some() {
        return 0;
    }
    if work_item.item_type == crate::work::WorkItemType::Goal {
        return 2;
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Test executor tracking observed concurrency.
    struct TrackingExecutor {
        current: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl TrackingExecutor {
        fn new(delay: Duration) -> Self {
            Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl ItemExecutor for TrackingExecutor {
        async fn execute(&self, work_item: WorkItem) -> WorkItemResult {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            WorkItemResult::done(&work_item.id, "ok")
        }
    }

    struct SlowExecutor;

    #[async_trait]
    impl ItemExecutor for SlowExecutor {
        async fn execute(&self, work_item: WorkItem) -> WorkItemResult {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            WorkItemResult::done(&work_item.id, "never reached")
        }
    }

    fn items(n: usize) -> Vec<WorkItem> {
        (0..n)
            .map(|i| WorkItem::task(format!("wi-{i:02}"), "t", "b"))
            .collect()
    }

    #[tokio::test]
    async fn test_dispatch_returns_result() {
        let executor = Arc::new(TrackingExecutor::new(Duration::from_millis(1)));
        let pool = ExecutorPool::new(executor);
        let result = pool.dispatch(WorkItem::task("wi-1", "t", "b"), "owner").await;
        assert_eq!(result.status, crate::work::WorkItemStatus::Done);
        assert_eq!(pool.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn test_scope_cap_respected() {
        let executor = Arc::new(TrackingExecutor::new(Duration::from_millis(20)));
        let pool = ExecutorPool::with_limits(executor.clone(), 3, 16);

        let results = pool.dispatch_parallel(items(10), "owner").await;
        assert_eq!(results.len(), 10);
        assert!(
            executor.peak.load(Ordering::SeqCst) <= 3,
            "peak concurrency {} exceeded scope cap",
            executor.peak.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_global_cap_spans_scopes() {
        let executor = Arc::new(TrackingExecutor::new(Duration::from_millis(20)));
        let pool = ExecutorPool::with_limits(executor.clone(), 8, 4);

        let a = pool.dispatch_parallel(items(6), "scope-a");
        let pool_b = pool.clone();
        let b_items: Vec<WorkItem> = (10..16)
            .map(|i| WorkItem::task(format!("wi-{i}"), "t", "b"))
            .collect();
        let b = pool_b.dispatch_parallel(b_items, "scope-b");
        let (ra, rb) = tokio::join!(a, b);
        assert_eq!(ra.len() + rb.len(), 12);
        assert!(executor.peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn test_conflicting_items_serialized() {
        let executor = Arc::new(TrackingExecutor::new(Duration::from_millis(20)));
        let pool = ExecutorPool::with_limits(executor.clone(), 4, 8);

        let mut a = WorkItem::task("wi-a", "t", "b");
        a.input_artifacts_from = vec!["shared.txt".to_owned()];
        let mut b = WorkItem::task("wi-b", "t", "b");
        b.input_artifacts_from = vec!["shared.txt".to_owned()];

        let results = pool.dispatch_parallel(vec![a, b], "owner").await;
        assert_eq!(results.len(), 2);
        assert_eq!(
            executor.peak.load(Ordering::SeqCst),
            1,
            "conflicting items must never overlap"
        );
    }

    #[tokio::test]
    async fn test_results_in_input_order() {
        let executor = Arc::new(TrackingExecutor::new(Duration::from_millis(1)));
        let pool = ExecutorPool::new(executor);
        let results = pool.dispatch_parallel(items(5), "owner").await;
        let ids: Vec<&str> = results.iter().map(|r| r.work_item_id.as_str()).collect();
        assert_eq!(ids, vec!["wi-00", "wi-01", "wi-02", "wi-03", "wi-04"]);
    }

    #[tokio::test]
    async fn test_cancel_yields_cancelled_result() {
        let pool = ExecutorPool::new(Arc::new(SlowExecutor));
        let dispatch = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.dispatch(WorkItem::task("wi-slow", "t", "b"), "owner").await })
        };

        // Wait for the item to be in flight, then cancel it.
        for _ in 0..100 {
            if pool.in_flight_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(pool.cancel("wi-slow").await);

        let result = dispatch.await.expect("dispatch task");
        assert_eq!(result.status, crate::work::WorkItemStatus::Failed);
        assert_eq!(result.last_error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_cancel_unknown_is_false() {
        let pool = ExecutorPool::new(Arc::new(SlowExecutor));
        assert!(!pool.cancel("never-dispatched").await);
    }

    #[test]
    fn test_conflict_groups() {
        let mut a = WorkItem::task("a", "t", "b");
        a.input_artifacts_from = vec!["x".to_owned()];
        let mut b = WorkItem::task("b", "t", "b");
        b.input_artifacts_from = vec!["x".to_owned()];
        let c = WorkItem::task("c", "t", "b");

        let groups = detect_conflicts(vec![a, b, c]);
        // c parallel group + a and b each serial.
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].len(), 1);
        assert_eq!(groups[0][0].id, "c");
    }

    #[test]
    fn test_priority_ordering() {
        let mut approved = WorkItem::task("a", "t", "b");
        approved.approval_token = Some(crate::approval::ApprovalToken {
            token_id: "t".to_owned(),
            plan_hash: String::new(),
            work_item_id: "a".to_owned(),
            scope: crate::approval::ApprovalScope::FullPlan,
            verdict: crate::approval::ApprovalVerdict::Approved,
            signature: Vec::new(),
            issued_at: chrono::Utc::now(),
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
            nonce: String::new(),
            approval_strength: "tap".to_owned(),
            conditions: serde_json::Map::new(),
            executions_used: 0,
            max_executions: 1,
            execution_nonces: Vec::new(),
        });
        let plain = WorkItem::task("p", "t", "b");
        let mut goal = WorkItem::task("g", "t", "b");
        goal.item_type = crate::work::WorkItemType::Goal;

        assert!(priority_key(&approved) < priority_key(&plain));
        assert!(priority_key(&plain) < priority_key(&goal));
    }
}
