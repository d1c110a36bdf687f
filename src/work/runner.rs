//! Retry loop and failure escalation for work items.
//!
//! Sits between the executor consumer and the raw executor: retries
//! with exponential backoff within the item's attempt budget, then
//! applies the item's `on_failure` policy — report, retry, escalate
//! (one retry, then the escalation hook), or pause for a human.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::item::{EscalationAction, WorkItem, WorkItemResult, WorkItemStatus};
use crate::exec::pool::ItemExecutor;

/// Called when an `on_failure = escalate` item exhausts its retries.
#[async_trait]
pub trait EscalationHook: Send + Sync {
    /// Surface the escalation. Failures here are logged, not fatal.
    async fn escalate(&self, work_item: &WorkItem, action: Option<&EscalationAction>);
}

/// Runs work items with retry, budget tracking, and failure escalation.
pub struct WorkItemRunner {
    executor: Arc<dyn ItemExecutor>,
    backoff_base: Duration,
    backoff_max: Duration,
    on_escalate: Option<Arc<dyn EscalationHook>>,
}

impl WorkItemRunner {
    /// Wrap an executor with default backoff (1 s base, 30 s cap).
    pub fn new(executor: Arc<dyn ItemExecutor>) -> Self {
        Self::with_backoff(executor, Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Wrap an executor with explicit backoff parameters.
    pub fn with_backoff(
        executor: Arc<dyn ItemExecutor>,
        backoff_base: Duration,
        backoff_max: Duration,
    ) -> Self {
        Self {
            executor,
            backoff_base,
            backoff_max,
            on_escalate: None,
        }
    }

    /// Attach an escalation hook.
    pub fn with_escalation_hook(mut self, hook: Arc<dyn EscalationHook>) -> Self {
        self.on_escalate = Some(hook);
        self
    }

    /// Execute a work item under its retry budget and failure policy.
    pub async fn run(&self, work_item: &WorkItem) -> WorkItemResult {
        let max_attempts = work_item.budget.max_attempts.max(1);
        let mut last_result: Option<WorkItemResult> = None;

        for attempt in 1..=max_attempts {
            let mut current = work_item.clone();
            current.attempts = attempt;

            let mut result = self.executor.execute(current).await;
            result.budget_used.attempts = attempt;

            if result.status == WorkItemStatus::Done {
                info!(
                    work_item_id = %work_item.id,
                    attempt,
                    max_attempts,
                    "work item completed"
                );
                return result;
            }

            let error = result
                .last_error
                .clone()
                .unwrap_or_else(|| result.summary.clone());
            last_result = Some(result);

            if !should_retry(&work_item.on_failure, attempt, max_attempts) {
                break;
            }

            let delay = self.backoff_delay(attempt);
            info!(
                work_item_id = %work_item.id,
                attempt,
                max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error,
                "work item failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }

        let result = last_result
            .unwrap_or_else(|| WorkItemResult::failed(&work_item.id, "no attempts ran", "no_attempts"));
        self.handle_failure(work_item, result).await
    }

    /// Exponential backoff `base * 2^(attempt-1)`, capped.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_base.saturating_mul(1u32 << exponent);
        delay.min(self.backoff_max)
    }

    async fn handle_failure(
        &self,
        work_item: &WorkItem,
        result: WorkItemResult,
    ) -> WorkItemResult {
        let mut failure_context = format!(
            "Work item '{}' failed after {} attempts. Last error: {}",
            work_item.title,
            result.budget_used.attempts,
            result
                .last_error
                .as_deref()
                .unwrap_or(result.summary.as_str()),
        );
        if let Some(dimension) = result.budget_used.exceeded_dimension(&work_item.budget) {
            failure_context.push_str(&format!(" (budget exceeded: {dimension})"));
        }

        match work_item.on_failure.as_str() {
            "pause" => {
                warn!(work_item_id = %work_item.id, "work item paused for human intervention");
                WorkItemResult {
                    status: WorkItemStatus::Stuck,
                    summary: format!("Paused: {failure_context}"),
                    ..result
                }
            }
            "escalate" => {
                let action = work_item.escalation.get("default");
                if let Some(hook) = &self.on_escalate {
                    warn!(work_item_id = %work_item.id, "escalating work item");
                    hook.escalate(work_item, action).await;
                }
                WorkItemResult {
                    summary: format!("Escalated: {failure_context}"),
                    ..result
                }
            }
            _ => WorkItemResult {
                status: WorkItemStatus::Failed,
                summary: failure_context,
                ..result
            },
        }
    }
}

/// Retry decision per `on_failure` policy.
///
/// `report` and `pause` never retry; `escalate` allows one retry before
/// escalating; `retry` (and anything unrecognised) retries to budget.
fn should_retry(on_failure: &str, attempt: u32, max_attempts: u32) -> bool {
    if attempt >= max_attempts {
        return false;
    }
    match on_failure {
        "report" | "pause" => false,
        "escalate" => attempt < 2,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::Budget;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Executor failing a fixed number of times before succeeding.
    struct FlakyExecutor {
        fail_count: u32,
        calls: AtomicU32,
    }

    impl FlakyExecutor {
        fn new(fail_count: u32) -> Self {
            Self {
                fail_count,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ItemExecutor for FlakyExecutor {
        async fn execute(&self, work_item: WorkItem) -> WorkItemResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst).saturating_add(1);
            if call <= self.fail_count {
                WorkItemResult::failed(&work_item.id, "failed", format!("attempt {call} failed"))
            } else {
                WorkItemResult::done(&work_item.id, "Execution completed.")
            }
        }
    }

    struct RecordingHook {
        calls: AtomicU32,
    }

    #[async_trait]
    impl EscalationHook for RecordingHook {
        async fn escalate(&self, _work_item: &WorkItem, _action: Option<&EscalationAction>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn item_with_policy(on_failure: &str, max_attempts: u32) -> WorkItem {
        let mut item = WorkItem::task("wi-1", "Test item", "body");
        item.on_failure = on_failure.to_owned();
        item.budget = Budget {
            max_attempts,
            ..Budget::default()
        };
        item
    }

    fn fast_runner(executor: Arc<dyn ItemExecutor>) -> WorkItemRunner {
        WorkItemRunner::with_backoff(executor, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let executor = Arc::new(FlakyExecutor::new(2));
        let runner = fast_runner(executor.clone());
        let result = runner.run(&item_with_policy("retry", 5)).await;
        assert_eq!(result.status, WorkItemStatus::Done);
        assert_eq!(result.budget_used.attempts, 3);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails() {
        let executor = Arc::new(FlakyExecutor::new(u32::MAX));
        let runner = fast_runner(executor.clone());
        let result = runner.run(&item_with_policy("retry", 3)).await;
        assert_eq!(result.status, WorkItemStatus::Failed);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
        assert!(result.summary.contains("failed after 3 attempts"));
    }

    #[tokio::test]
    async fn test_report_never_retries() {
        let executor = Arc::new(FlakyExecutor::new(u32::MAX));
        let runner = fast_runner(executor.clone());
        let result = runner.run(&item_with_policy("report", 5)).await;
        assert_eq!(result.status, WorkItemStatus::Failed);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pause_returns_stuck() {
        let executor = Arc::new(FlakyExecutor::new(u32::MAX));
        let runner = fast_runner(executor.clone());
        let result = runner.run(&item_with_policy("pause", 5)).await;
        assert_eq!(result.status, WorkItemStatus::Stuck);
        assert!(result.summary.starts_with("Paused:"));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_escalate_allows_one_retry_then_hooks() {
        let executor = Arc::new(FlakyExecutor::new(u32::MAX));
        let hook = Arc::new(RecordingHook {
            calls: AtomicU32::new(0),
        });
        let runner = fast_runner(executor.clone()).with_escalation_hook(hook.clone());

        let result = runner.run(&item_with_policy("escalate", 5)).await;
        assert!(result.summary.starts_with("Escalated:"));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2, "one retry before escalation");
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_escalate_succeeding_on_retry_completes() {
        let executor = Arc::new(FlakyExecutor::new(1));
        let runner = fast_runner(executor);
        let result = runner.run(&item_with_policy("escalate", 5)).await;
        assert_eq!(result.status, WorkItemStatus::Done);
    }
}
