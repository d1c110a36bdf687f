//! Long-term memory: SQLite + FTS5 store, taint-gated retrieval,
//! agent-requested write ops, and portable export/import bundles.

pub mod ops;
pub mod portability;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::TaintLevel;

/// Memory subsystem errors.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// SQLite failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// JSON (de)serialization failure on a stored column.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// An enum column held an unrecognised value.
    #[error("invalid {field} value: {value}")]
    InvalidEnum {
        field: &'static str,
        value: String,
    },
    /// Import bundle rejected.
    #[error("incompatible bundle: {0}")]
    IncompatibleBundle(String),
    /// A memory op referenced a missing field.
    #[error("invalid memory op: {0}")]
    InvalidOp(String),
}

/// Kind of memory stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Episode,
    Fact,
    Preference,
    Skill,
    Entity,
    Profile,
}

impl MemoryType {
    /// String form stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Episode => "episode",
            Self::Fact => "fact",
            Self::Preference => "preference",
            Self::Skill => "skill",
            Self::Entity => "entity",
            Self::Profile => "profile",
        }
    }

    /// Parse from a SQLite text value.
    pub fn parse(s: &str) -> Result<Self, MemoryError> {
        match s {
            "episode" => Ok(Self::Episode),
            "fact" => Ok(Self::Fact),
            "preference" => Ok(Self::Preference),
            "skill" => Ok(Self::Skill),
            "entity" => Ok(Self::Entity),
            "profile" => Ok(Self::Profile),
            other => Err(MemoryError::InvalidEnum {
                field: "memory_type",
                value: other.to_owned(),
            }),
        }
    }
}

/// How aggressively a memory re-enters working context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReingestionTier {
    Active,
    LowReingestion,
    Core,
    Dormant,
}

impl ReingestionTier {
    /// String form stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::LowReingestion => "low_reingestion",
            Self::Core => "core",
            Self::Dormant => "dormant",
        }
    }

    /// Parse from a SQLite text value.
    pub fn parse(s: &str) -> Result<Self, MemoryError> {
        match s {
            "active" => Ok(Self::Active),
            "low_reingestion" => Ok(Self::LowReingestion),
            "core" => Ok(Self::Core),
            "dormant" => Ok(Self::Dormant),
            other => Err(MemoryError::InvalidEnum {
                field: "reingestion_tier",
                value: other.to_owned(),
            }),
        }
    }
}

/// How much the system trusts a memory's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Working,
    Verified,
    Constitutional,
}

impl TrustLevel {
    /// String form stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::Verified => "verified",
            Self::Constitutional => "constitutional",
        }
    }

    /// Parse from a SQLite text value.
    pub fn parse(s: &str) -> Result<Self, MemoryError> {
        match s {
            "working" => Ok(Self::Working),
            "verified" => Ok(Self::Verified),
            "constitutional" => Ok(Self::Constitutional),
            other => Err(MemoryError::InvalidEnum {
                field: "trust_level",
                value: other.to_owned(),
            }),
        }
    }
}

/// One long-term memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub memory_id: String,
    pub content: String,
    pub memory_type: MemoryType,
    #[serde(default = "default_tier")]
    pub reingestion_tier: ReingestionTier,
    #[serde(default = "default_trust")]
    pub trust_level: TrustLevel,
    #[serde(default = "default_taint")]
    pub taint: TaintLevel,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub access_count: u32,
    #[serde(default)]
    pub last_accessed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub semantic_tags: Vec<String>,
    #[serde(default)]
    pub entity_refs: Vec<String>,
    #[serde(default)]
    pub causal_refs: Vec<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub source_kind: String,
}

fn default_tier() -> ReingestionTier {
    ReingestionTier::Active
}

fn default_trust() -> TrustLevel {
    TrustLevel::Working
}

fn default_taint() -> TaintLevel {
    TaintLevel::Owner
}

impl MemoryItem {
    /// Build a memory with defaults for the bookkeeping fields.
    pub fn new(
        memory_id: impl Into<String>,
        content: impl Into<String>,
        memory_type: MemoryType,
        source_kind: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            memory_id: memory_id.into(),
            content: content.into(),
            memory_type,
            reingestion_tier: ReingestionTier::Active,
            trust_level: TrustLevel::Working,
            taint: TaintLevel::Owner,
            created_at: now,
            updated_at: now,
            access_count: 0,
            last_accessed: None,
            semantic_tags: Vec::new(),
            entity_refs: Vec::new(),
            causal_refs: Vec::new(),
            session_id: None,
            embedding: None,
            source_kind: source_kind.into(),
        }
    }
}

pub use ops::{filter_for_taint, MemoryOp, MemoryOpKind, MemoryOps};
pub use portability::{ExportFilters, ImportMode, ImportResult, MemoryBundle, Portability};
pub use store::MemoryStore;
