#![allow(missing_docs)]

//! Straylight — personal AI runtime kernel.
//!
//! Operational entry point: `start` boots the queue bus with the
//! built-in skill-backed executor and pass-through proxy/planner
//! defaults (real LLM agents plug in through the `ProxyAgent`,
//! `PlannerAgent`, and `ExecutorAgent` traits); `audit` verifies or
//! checkpoints the hash chain; `db init` creates the schemas.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::sync::Mutex;
use tracing::info;

use straylight::approval::{ApprovalManager, ApprovalVerifier};
use straylight::audit::AuditLog;
use straylight::config::StraylightConfig;
use straylight::exec::{
    Consumer, ConsultManager, ExecutorAgent, ExecutorConsumer, Orchestrator, PlannerAgent,
    PlannerConsumer, PlannerOutput, ProxyAgent, ProxyConsumer, ProxyDecision, ReplanManager,
    ResearchStateMachine,
};
use straylight::gates::ToolTaintRegistry;
use straylight::goals::GoalManager;
use straylight::memory::MemoryStore;
use straylight::persistence::{open_pool, NonceStore};
use straylight::queue::{QueueStore, Router};
use straylight::skills::{register_builtin_skills, SkillExecutor, SkillRegistry};
use straylight::types::TaintLevel;
use straylight::work::{executor::SingleItemRunner, WorkItemRunner, WorkItemStore};

#[derive(Parser)]
#[command(name = "straylight", about = "Personal AI runtime kernel", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the kernel: queue consumers, approval pipeline, executor.
    Start,
    /// Audit chain operations.
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
    /// Database operations.
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Subcommand)]
enum AuditCommand {
    /// Verify the full hash chain.
    Verify,
    /// Record a checkpoint at the current chain head.
    Checkpoint,
}

#[derive(Subcommand)]
enum DbCommand {
    /// Create all kernel schemas.
    Init,
}

/// Default proxy: forward every message to the planner unchanged.
struct PassthroughProxy;

#[async_trait]
impl ProxyAgent for PassthroughProxy {
    async fn handle_user_message(&self, text: &str, taint: TaintLevel) -> ProxyDecision {
        // Untrusted senders get no planning from the default proxy.
        if taint == TaintLevel::External {
            return ProxyDecision::Respond {
                text: "I can't act on unverified external messages.".to_owned(),
            };
        }
        ProxyDecision::Plan {
            request: text.to_owned(),
        }
    }
}

/// Default planner: wrap the request in a single-task plan.
struct TemplatePlanner;

#[async_trait]
impl PlannerAgent for TemplatePlanner {
    async fn plan(
        &self,
        request: &str,
        _replan_depth: u32,
        _failure_context: Option<&str>,
    ) -> PlannerOutput {
        // Title must stay a single-line YAML scalar.
        let title = request
            .lines()
            .next()
            .unwrap_or("Planned task")
            .replace(['"', '\n'], " ");
        PlannerOutput {
            plan_markdown: Some(format!(
                "---\nid: plan-{}\ntype: task\ntitle: \"{}\"\n---\n{request}",
                uuid::Uuid::new_v4().simple(),
                title.trim(),
            )),
            research_requests: Vec::new(),
        }
    }

    async fn finalize(&self, request: &str, _research: &HashMap<String, String>) -> String {
        format!(
            "---\nid: plan-{}\ntype: task\ntitle: Finalized plan\n---\n{request}",
            uuid::Uuid::new_v4().simple(),
        )
    }

    async fn guidance(&self, _work_item_id: &str, failure_context: &str) -> String {
        format!("Re-read the failure and simplify the approach: {failure_context}")
    }
}

/// Default research agent: acknowledge without external access.
struct OfflineResearcher;

#[async_trait]
impl ExecutorAgent for OfflineResearcher {
    async fn research(&self, query: &str, _return_format: &str, _max_tokens: u32) -> String {
        format!("No research backend configured; unanswered query: {query}")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = StraylightConfig::load()?;

    match cli.command {
        Command::Start => start(config).await,
        Command::Audit { command } => {
            straylight::logging::init_cli();
            audit(config, command).await
        }
        Command::Db { command } => {
            straylight::logging::init_cli();
            match command {
                DbCommand::Init => init_db(config).await,
            }
        }
    }
}

async fn start(config: StraylightConfig) -> Result<()> {
    std::fs::create_dir_all(&config.paths.data_dir).with_context(|| {
        format!(
            "failed to create data directory {}",
            config.paths.data_dir.display()
        )
    })?;
    let _logging = straylight::logging::init_production(&config.paths.logs_dir)?;
    info!("straylight starting");

    let pool = open_pool(config.paths.kernel_db()).await?;

    // Stores.
    let queue_store = QueueStore::with_lease_ttl(
        pool.clone(),
        chrono::Duration::seconds(config.queue.lease_ttl_seconds),
    );
    queue_store.initialize().await?;
    let work_store = WorkItemStore::new(pool.clone());
    work_store.initialize().await?;
    let memory_store = MemoryStore::new(pool.clone());
    memory_store.initialize().await?;
    let nonce_store = NonceStore::new(pool.clone());
    nonce_store.initialize().await?;
    let audit_log = AuditLog::new(pool.clone());
    audit_log.initialize().await?;

    // Integrity gate: refuse startup on a broken audit chain.
    let entries = audit_log.assert_intact().await?;
    info!(entries, "audit chain verified");

    // Approval pipeline.
    let verifier = Arc::new(ApprovalVerifier::generate(nonce_store));
    let approvals = Arc::new(Mutex::new(ApprovalManager::default()));
    let goals = Arc::new(Mutex::new(GoalManager::new()));

    // Skills and execution.
    let tool_taints = ToolTaintRegistry::new();
    let registry = SkillRegistry::new(tool_taints);
    register_builtin_skills(&registry);
    let skill_executor = SkillExecutor::new(registry, Some(memory_store));

    let item_runner = Arc::new(SingleItemRunner::new(
        skill_executor,
        work_store,
        Some(verifier.clone()),
    ));
    let runner = Arc::new(WorkItemRunner::with_backoff(
        item_runner,
        Duration::from_secs(config.executor.backoff_base_seconds),
        Duration::from_secs(config.executor.backoff_max_seconds),
    ));

    // Bus and consumers.
    let router = Router::new(queue_store.clone());
    let consult = ConsultManager::with_timeout(
        queue_store.clone(),
        router.clone(),
        Duration::from_secs(config.consult.timeout_seconds),
    );
    let replan = ReplanManager::new(router.clone());

    let proxy: Arc<dyn Consumer> = Arc::new(
        ProxyConsumer::new(
            Arc::new(PassthroughProxy),
            queue_store.clone(),
            router.clone(),
            approvals,
            goals,
            verifier,
            None,
        )
        .with_approval_wait(Duration::from_secs(config.approval.verdict_wait_seconds)),
    );
    let planner: Arc<dyn Consumer> = Arc::new(PlannerConsumer::new(
        Arc::new(TemplatePlanner),
        queue_store.clone(),
        router.clone(),
        ResearchStateMachine::new(
            config.research.max_in_flight,
            config.research.max_rounds,
            config.research.timeout_seconds,
        ),
    ));
    let executor: Arc<dyn Consumer> = Arc::new(ExecutorConsumer::new(
        Arc::new(OfflineResearcher),
        queue_store,
        router,
        runner,
        consult,
        replan,
    ));

    let mut orchestrator = Orchestrator::new(vec![proxy, planner, executor]);
    orchestrator.start();
    info!("straylight running; press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    orchestrator.stop().await;
    Ok(())
}

async fn audit(config: StraylightConfig, command: AuditCommand) -> Result<()> {
    let pool = open_pool(config.paths.kernel_db()).await?;
    let audit_log = AuditLog::new(pool);
    audit_log.initialize().await?;

    match command {
        AuditCommand::Verify => {
            let (ok, count) = audit_log.verify_chain().await?;
            if ok {
                println!("audit chain intact: {count} entries");
                Ok(())
            } else {
                anyhow::bail!("audit chain verification FAILED");
            }
        }
        AuditCommand::Checkpoint => {
            let checkpoint_id = audit_log.write_checkpoint().await?;
            println!("checkpoint written: {checkpoint_id}");
            Ok(())
        }
    }
}

async fn init_db(config: StraylightConfig) -> Result<()> {
    std::fs::create_dir_all(&config.paths.data_dir)?;
    let pool = open_pool(config.paths.kernel_db()).await?;

    QueueStore::new(pool.clone()).initialize().await?;
    WorkItemStore::new(pool.clone()).initialize().await?;
    MemoryStore::new(pool.clone()).initialize().await?;
    NonceStore::new(pool.clone()).initialize().await?;
    AuditLog::new(pool).initialize().await?;

    println!(
        "initialized kernel database at {}",
        config.paths.kernel_db().display()
    );
    Ok(())
}
