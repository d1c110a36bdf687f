//! Consumer lifecycle: one poll loop per consumer with exponential
//! backoff when the queue is idle.
//!
//! Backoff starts at the base interval, doubles to the cap while the
//! queue stays empty, and snaps back to the base as soon as a message
//! is found — responsive under load, gentle on SQLite when idle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

use super::consumers::Consumer;

/// Base poll interval.
const POLL_BASE_MS: u64 = 100;

/// Backoff multiplier while idle.
const BACKOFF_MULTIPLIER: u32 = 2;

/// Backoff cap — worst-case latency for a quiet queue.
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Runs all queue consumers as background tasks.
pub struct Orchestrator {
    consumers: Vec<Arc<dyn Consumer>>,
    running: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Build an orchestrator over a set of consumers.
    pub fn new(consumers: Vec<Arc<dyn Consumer>>) -> Self {
        Self {
            consumers,
            running: Arc::new(AtomicBool::new(false)),
            tasks: Vec::new(),
        }
    }

    /// Whether the poll loops are active.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start all consumers. Idempotent: a second call is a no-op.
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        for consumer in &self.consumers {
            let consumer = consumer.clone();
            let running = self.running.clone();
            let name = consumer.queue_name();
            self.tasks.push(tokio::spawn(async move {
                run_consumer(consumer, running).await;
                info!(queue = name, "consumer loop exited");
            }));
        }
        info!(count = self.consumers.len(), "orchestrator started consumers");
    }

    /// Graceful shutdown: stop polling, await every consumer task.
    ///
    /// Poll loops exit after their current iteration; task errors are
    /// logged, never propagated.
    pub async fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                error!(error = %err, "consumer task failed during shutdown");
            }
        }
        info!("orchestrator stopped");
    }
}

/// One consumer's poll loop with idle backoff.
async fn run_consumer(consumer: Arc<dyn Consumer>, running: Arc<AtomicBool>) {
    let base = Duration::from_millis(POLL_BASE_MS);
    let mut interval = base;

    while running.load(Ordering::SeqCst) {
        let found = match consumer.poll_once().await {
            Ok(found) => found,
            Err(err) => {
                // Poll failures are logged and the loop continues; the
                // message (if leased) times back out via the lease TTL.
                error!(queue = consumer.queue_name(), error = %err, "poll_once failed");
                false
            }
        };

        interval = if found {
            base
        } else {
            interval.saturating_mul(BACKOFF_MULTIPLIER).min(BACKOFF_MAX)
        };
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct CountingConsumer {
        polls: AtomicU32,
    }

    #[async_trait]
    impl Consumer for CountingConsumer {
        fn queue_name(&self) -> &'static str {
            "test_queue"
        }

        async fn poll_once(&self) -> Result<bool, crate::queue::QueueError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let consumer = Arc::new(CountingConsumer {
            polls: AtomicU32::new(0),
        });
        let mut orchestrator = Orchestrator::new(vec![consumer.clone()]);
        assert!(!orchestrator.running());

        orchestrator.start();
        assert!(orchestrator.running());
        tokio::time::sleep(Duration::from_millis(50)).await;
        orchestrator.stop().await;
        assert!(!orchestrator.running());

        assert!(consumer.polls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let consumer = Arc::new(CountingConsumer {
            polls: AtomicU32::new(0),
        });
        let mut orchestrator = Orchestrator::new(vec![consumer]);
        orchestrator.start();
        orchestrator.start();
        assert_eq!(orchestrator.tasks.len(), 1);
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let mut orchestrator = Orchestrator::new(vec![]);
        orchestrator.stop().await;
        assert!(!orchestrator.running());
    }
}
