//! Configuration loading and management.
//!
//! Loads kernel configuration from `./straylight.toml` (or
//! `$STRAYLIGHT_CONFIG_PATH`). Environment variables override file
//! values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level kernel configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StraylightConfig {
    /// Filesystem paths for persistent state.
    pub paths: PathsConfig,
    /// Approval pipeline settings.
    pub approval: ApprovalConfig,
    /// Executor pool and retry settings.
    pub executor: ExecutorConfig,
    /// Queue bus settings.
    pub queue: QueueConfig,
    /// Planner research settings.
    pub research: ResearchConfig,
    /// Consult-planner settings.
    pub consult: ConsultConfig,
    /// Memory store settings.
    pub memory: MemoryConfig,
    /// Worktree isolation settings.
    pub worktree: WorktreeConfig,
}

/// Filesystem paths for persistent state.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding the SQLite databases.
    pub data_dir: PathBuf,
    /// Directory for rotated log files.
    pub logs_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            logs_dir: PathBuf::from("./logs"),
        }
    }
}

impl PathsConfig {
    /// Path of the kernel database.
    pub fn kernel_db(&self) -> PathBuf {
        self.data_dir.join("straylight.db")
    }
}

/// Approval pipeline settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Pending-approval timeout in seconds.
    pub timeout_seconds: u64,
    /// How long the proxy waits for a human verdict, in seconds.
    pub verdict_wait_seconds: u64,
    /// Rolling window for fatigue analysis, in minutes.
    pub fatigue_window_minutes: u32,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 3600,
            verdict_wait_seconds: 300,
            fatigue_window_minutes: 30,
        }
    }
}

/// Executor pool and retry settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Per-scope concurrency cap.
    pub max_concurrent: usize,
    /// Global concurrency cap.
    pub max_concurrent_global: usize,
    /// Retry backoff base in seconds.
    pub backoff_base_seconds: u64,
    /// Retry backoff cap in seconds.
    pub backoff_max_seconds: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            max_concurrent_global: 16,
            backoff_base_seconds: 1,
            backoff_max_seconds: 30,
        }
    }
}

/// Queue bus settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Lease TTL in seconds before a message is reclaimable.
    pub lease_ttl_seconds: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_ttl_seconds: 60,
        }
    }
}

/// Planner research settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    /// Concurrently in-flight research cap.
    pub max_in_flight: usize,
    /// Total dispatches per planning cycle.
    pub max_rounds: usize,
    /// Per-request timeout in seconds.
    pub timeout_seconds: u64,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 3,
            max_rounds: 5,
            timeout_seconds: 120,
        }
    }
}

/// Consult-planner settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsultConfig {
    /// Guidance wait in seconds.
    pub timeout_seconds: u64,
}

impl Default for ConsultConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 90,
        }
    }
}

/// Memory store settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Cap on agent-requested memory ops per turn.
    pub max_memory_ops_per_turn: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_memory_ops_per_turn: 10,
        }
    }
}

/// Worktree isolation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorktreeConfig {
    /// Canonical workspace root (a git repository).
    pub canonical_root: Option<PathBuf>,
    /// Directory for per-attempt worktrees.
    pub runtime_dir: Option<PathBuf>,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            canonical_root: None,
            runtime_dir: None,
        }
    }
}

impl StraylightConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$STRAYLIGHT_CONFIG_PATH` or `./straylight.toml`.
    /// A missing file means defaults.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = std::env::var("STRAYLIGHT_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./straylight.toml"));
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: StraylightConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(StraylightConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Apply environment overrides through a lookup closure (injectable
    /// for tests).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("STRAYLIGHT_DATA_DIR") {
            self.paths.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("STRAYLIGHT_LOGS_DIR") {
            self.paths.logs_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup("STRAYLIGHT_MAX_CONCURRENT") {
            if let Ok(parsed) = value.parse() {
                self.executor.max_concurrent = parsed;
            }
        }
        if let Some(value) = lookup("STRAYLIGHT_MAX_CONCURRENT_GLOBAL") {
            if let Ok(parsed) = value.parse() {
                self.executor.max_concurrent_global = parsed;
            }
        }
        if let Some(value) = lookup("STRAYLIGHT_CONSULT_TIMEOUT_SECONDS") {
            if let Ok(parsed) = value.parse() {
                self.consult.timeout_seconds = parsed;
            }
        }
    }
}
