//! Skill registry and executor.
//!
//! A skill is a named, versioned capability with declared schemas, an
//! approval requirement, retry/timeout policy, and a taint ceiling.
//! Handler bodies are external collaborators — the kernel ships only the
//! built-ins (`web_search` stub, `memory_store`, `memory_recall`) and
//! the machinery that runs registered handlers safely.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::gates::ToolTaintRegistry;
use crate::memory::{MemoryItem, MemoryStore, MemoryType};
use crate::types::TaintLevel;
use crate::work::WorkItem;

/// Base backoff between skill retries.
const RETRY_BACKOFF_BASE_MS: u64 = 100;

/// Skill subsystem errors (handler-internal failures become
/// `SkillResult { success: false }`, not `Err`).
#[derive(Debug, Error)]
pub enum SkillError {
    /// A handler input failed validation.
    #[error("invalid skill input: {0}")]
    InvalidInput(String),
    /// A handler needed a collaborator that wasn't configured.
    #[error("skill dependency missing: {0}")]
    MissingDependency(&'static str),
    /// Handler-internal failure.
    #[error("{0}")]
    Handler(String),
}

impl From<crate::memory::MemoryError> for SkillError {
    fn from(e: crate::memory::MemoryError) -> Self {
        Self::Handler(e.to_string())
    }
}

/// Declared metadata for one skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillDefinition {
    pub name: String,
    pub description: String,
    pub version: String,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(default)]
    pub output_schema: Value,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    /// Taint ceiling this skill's output carries.
    #[serde(default = "default_skill_taint")]
    pub taint_level: TaintLevel,
}

fn default_timeout() -> u64 {
    30
}

fn default_skill_taint() -> TaintLevel {
    TaintLevel::Owner
}

/// Outcome of one skill execution (including its internal retries).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillResult {
    pub skill_name: String,
    pub success: bool,
    pub output: Value,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: i64,
    pub retries_used: u32,
}

/// Registry of installed skills, keyed by name.
///
/// Registration publishes the skill's declared taint ceiling into the
/// shared tool-taint registry so trackers see it immediately.
#[derive(Debug, Clone)]
pub struct SkillRegistry {
    skills: Arc<RwLock<HashMap<String, SkillDefinition>>>,
    tool_taints: ToolTaintRegistry,
}

impl SkillRegistry {
    /// Create a registry publishing taints into `tool_taints`.
    pub fn new(tool_taints: ToolTaintRegistry) -> Self {
        Self {
            skills: Arc::new(RwLock::new(HashMap::new())),
            tool_taints,
        }
    }

    /// Register or replace a skill.
    pub fn register(&self, skill: SkillDefinition) {
        self.tool_taints.declare(&skill.name, skill.taint_level);
        if let Ok(mut map) = self.skills.write() {
            map.insert(skill.name.clone(), skill);
        }
    }

    /// Fetch a skill definition by name.
    pub fn get(&self, name: &str) -> Option<SkillDefinition> {
        self.skills.read().ok().and_then(|map| map.get(name).cloned())
    }

    /// Whether a skill is registered.
    pub fn has(&self, name: &str) -> bool {
        self.skills.read().is_ok_and(|map| map.contains_key(name))
    }

    /// All skills, sorted by name.
    pub fn list_all(&self) -> Vec<SkillDefinition> {
        let Ok(map) = self.skills.read() else {
            return Vec::new();
        };
        let mut skills: Vec<SkillDefinition> = map.values().cloned().collect();
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, SkillError>> + Send>>;

/// An async skill handler: JSON inputs in, JSON output out.
pub type SkillHandler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// Runs registered skill handlers with timeout, retry, and the
/// approval floor.
#[derive(Clone)]
pub struct SkillExecutor {
    registry: SkillRegistry,
    handlers: Arc<RwLock<HashMap<String, SkillHandler>>>,
    memory_store: Option<MemoryStore>,
}

impl SkillExecutor {
    /// Create an executor with the built-in handlers registered.
    pub fn new(registry: SkillRegistry, memory_store: Option<MemoryStore>) -> Self {
        let executor = Self {
            registry,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            memory_store,
        };
        executor.register_builtin_handlers();
        executor
    }

    /// Register or replace a handler for a skill name.
    pub fn register_handler(&self, skill_name: &str, handler: SkillHandler) {
        if let Ok(mut map) = self.handlers.write() {
            map.insert(skill_name.to_owned(), handler);
        }
    }

    /// Whether skill metadata demands explicit approval at execution time.
    pub fn skill_requires_approval(&self, skill_name: &str) -> bool {
        self.registry
            .get(skill_name)
            .is_some_and(|d| d.requires_approval)
    }

    /// Execute a skill for a work item.
    ///
    /// Unregistered skills, missing handlers, and approval-floor
    /// violations return failed results without running anything.
    /// Handler errors and timeouts retry up to the definition's
    /// `max_retries` with exponential backoff.
    pub async fn execute(
        &self,
        skill_name: &str,
        inputs: Value,
        work_item: Option<&WorkItem>,
    ) -> SkillResult {
        let started_at = Utc::now();

        let Some(definition) = self.registry.get(skill_name) else {
            return failure(
                skill_name,
                format!("skill '{skill_name}' is not registered"),
                started_at,
                0,
            );
        };

        if definition.requires_approval && !has_approval(work_item) {
            return failure(
                skill_name,
                format!("skill '{skill_name}' requires approval"),
                started_at,
                0,
            );
        }

        let handler = {
            let Ok(map) = self.handlers.read() else {
                return failure(skill_name, "handler registry poisoned".to_owned(), started_at, 0);
            };
            map.get(skill_name).cloned()
        };
        let Some(handler) = handler else {
            return failure(
                skill_name,
                format!("no executor handler for skill '{skill_name}'"),
                started_at,
                0,
            );
        };

        let mut retries_used: u32 = 0;
        let mut last_error: Option<String> = None;
        let max_attempts = definition.max_retries.saturating_add(1);

        for attempt in 0..max_attempts {
            let run = tokio::time::timeout(
                Duration::from_secs(definition.timeout_seconds),
                handler(inputs.clone()),
            )
            .await;

            match run {
                Ok(Ok(output)) => {
                    return SkillResult {
                        skill_name: skill_name.to_owned(),
                        success: true,
                        output,
                        error: None,
                        duration_ms: duration_ms(started_at),
                        retries_used,
                    };
                }
                Ok(Err(err)) => last_error = Some(err.to_string()),
                Err(_) => {
                    last_error = Some(format!(
                        "skill '{skill_name}' timed out after {} seconds",
                        definition.timeout_seconds
                    ));
                }
            }

            if attempt < definition.max_retries {
                retries_used = retries_used.saturating_add(1);
                tokio::time::sleep(backoff(retries_used)).await;
            }
        }

        failure(
            skill_name,
            last_error.unwrap_or_else(|| format!("skill '{skill_name}' failed")),
            started_at,
            retries_used,
        )
    }

    // ── built-in handlers ───────────────────────────────────────────

    fn register_builtin_handlers(&self) {
        self.register_handler(
            "web_search",
            Arc::new(|inputs| Box::pin(run_web_search(inputs))),
        );

        let store = self.memory_store.clone();
        self.register_handler(
            "memory_store",
            Arc::new(move |inputs| {
                let store = store.clone();
                Box::pin(run_memory_store(store, inputs))
            }),
        );

        let store = self.memory_store.clone();
        self.register_handler(
            "memory_recall",
            Arc::new(move |inputs| {
                let store = store.clone();
                Box::pin(run_memory_recall(store, inputs))
            }),
        );
    }
}

fn has_approval(work_item: Option<&WorkItem>) -> bool {
    let Some(work_item) = work_item else {
        return false;
    };
    if !work_item.needs_approval {
        return true;
    }
    work_item.approval_token.is_some()
}

fn failure(skill_name: &str, error: String, started_at: chrono::DateTime<Utc>, retries: u32) -> SkillResult {
    SkillResult {
        skill_name: skill_name.to_owned(),
        success: false,
        output: json!({}),
        error: Some(error),
        duration_ms: duration_ms(started_at),
        retries_used: retries,
    }
}

fn duration_ms(started_at: chrono::DateTime<Utc>) -> i64 {
    (Utc::now() - started_at).num_milliseconds()
}

fn backoff(retry_number: u32) -> Duration {
    let exponent = retry_number.saturating_sub(1).min(16);
    Duration::from_millis(RETRY_BACKOFF_BASE_MS.saturating_mul(1u64 << exponent))
}

fn required_str(inputs: &Value, field: &str) -> Result<String, SkillError> {
    match inputs.get(field).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Ok(s.to_owned()),
        _ => Err(SkillError::InvalidInput(format!(
            "'{field}' must be a non-empty string"
        ))),
    }
}

fn resolve_limit(inputs: &Value, default: usize) -> Result<usize, SkillError> {
    match inputs.get("limit") {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(v) if v > 0 => Ok(usize::try_from(v).unwrap_or(usize::MAX)),
            _ => Err(SkillError::InvalidInput("'limit' must be > 0".to_owned())),
        },
        _ => Err(SkillError::InvalidInput("'limit' must be an integer".to_owned())),
    }
}

/// Stub web search returning deterministic mock results.
async fn run_web_search(inputs: Value) -> Result<Value, SkillError> {
    let query = required_str(&inputs, "query")?;
    let limit = resolve_limit(&inputs, 5)?;
    let results: Vec<Value> = (1..=limit)
        .map(|idx| {
            json!({
                "title": format!("Mock result {idx} for {query}"),
                "url": format!("https://example.com/search/{idx}"),
                "snippet": format!("Mock web_search snippet {idx} for query '{query}'."),
            })
        })
        .collect();
    Ok(json!({ "results": results }))
}

async fn run_memory_store(store: Option<MemoryStore>, inputs: Value) -> Result<Value, SkillError> {
    let store = store.ok_or(SkillError::MissingDependency("memory_store"))?;
    let content = required_str(&inputs, "content")?;
    let memory_type_raw = required_str(&inputs, "memory_type")?;
    let memory_type = MemoryType::parse(&memory_type_raw)
        .map_err(|e| SkillError::InvalidInput(e.to_string()))?;

    let memory_id = format!("skill:{}:{}", memory_type.as_str(), Uuid::new_v4().simple());
    let item = MemoryItem::new(&memory_id, content, memory_type, "skill:memory_store");
    store.store(&item).await?;

    Ok(json!({
        "memory_id": memory_id,
        "memory_type": memory_type.as_str(),
        "stored_at": item.created_at.to_rfc3339(),
    }))
}

async fn run_memory_recall(store: Option<MemoryStore>, inputs: Value) -> Result<Value, SkillError> {
    let store = store.ok_or(SkillError::MissingDependency("memory_store"))?;
    let query = required_str(&inputs, "query")?;
    let limit = resolve_limit(&inputs, 5)?;
    let items = store.search_keyword(&query, limit, None).await?;
    let results: Vec<Value> = items
        .iter()
        .map(|item| serde_json::to_value(item).unwrap_or(Value::Null))
        .collect();
    Ok(json!({ "results": results }))
}

/// Definitions for the built-in skills.
pub fn builtin_skill_definitions() -> Vec<SkillDefinition> {
    vec![
        SkillDefinition {
            name: "web_search".to_owned(),
            description: "Retrieve web results for a search query.".to_owned(),
            version: "1.0.0".to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "integer", "minimum": 1},
                },
                "required": ["query"],
            }),
            output_schema: json!({
                "type": "object",
                "properties": {"results": {"type": "array", "items": {"type": "object"}}},
            }),
            requires_approval: false,
            max_retries: 1,
            timeout_seconds: 10,
            taint_level: TaintLevel::External,
        },
        SkillDefinition {
            name: "memory_store".to_owned(),
            description: "Store an item in long-term memory.".to_owned(),
            version: "1.0.0".to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "content": {"type": "string"},
                    "memory_type": {"type": "string"},
                },
                "required": ["content", "memory_type"],
            }),
            output_schema: json!({
                "type": "object",
                "properties": {
                    "memory_id": {"type": "string"},
                    "memory_type": {"type": "string"},
                    "stored_at": {"type": "string"},
                },
            }),
            requires_approval: true,
            max_retries: 1,
            timeout_seconds: 15,
            taint_level: TaintLevel::Owner,
        },
        SkillDefinition {
            name: "memory_recall".to_owned(),
            description: "Recall relevant memories by keyword search.".to_owned(),
            version: "1.0.0".to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "integer", "minimum": 1},
                },
                "required": ["query"],
            }),
            output_schema: json!({
                "type": "object",
                "properties": {"results": {"type": "array", "items": {"type": "object"}}},
            }),
            requires_approval: false,
            max_retries: 1,
            timeout_seconds: 10,
            taint_level: TaintLevel::Owner,
        },
    ]
}

/// Register the built-in skill definitions.
pub fn register_builtin_skills(registry: &SkillRegistry) {
    for definition in builtin_skill_definitions() {
        registry.register(definition);
    }
}
