//! Scoped context zones with token-budget eviction.
//!
//! Each execution scope (owner session, side task) has three zones:
//! `chronicle` (the conversation), `memory` (recalled items), and
//! `workspace` (task artifacts). Adding past the zone's token budget
//! evicts oldest-first; evicted items are handed back via
//! [`ContextManager::take_last_evicted`] so the caller can persist them
//! to long-term memory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::TaintLevel;

/// Default per-zone token budget.
const DEFAULT_ZONE_BUDGET: u64 = 8_000;

/// Partition of a scope's context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextZone {
    Chronicle,
    Memory,
    Workspace,
}

/// One item placed into a scope's context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub ctx_id: String,
    pub zone: ContextZone,
    pub content: String,
    pub token_count: u64,
    pub created_at: DateTime<Utc>,
    pub turn_number: u64,
    pub source: String,
    pub taint: TaintLevel,
    pub kind: String,
}

impl ContextItem {
    /// Build an item, estimating tokens from content length.
    pub fn new(
        ctx_id: impl Into<String>,
        zone: ContextZone,
        content: impl Into<String>,
        turn_number: u64,
        source: impl Into<String>,
        taint: TaintLevel,
        kind: impl Into<String>,
    ) -> Self {
        let content = content.into();
        Self {
            ctx_id: ctx_id.into(),
            zone,
            token_count: estimate_tokens(&content),
            content,
            created_at: Utc::now(),
            turn_number,
            source: source.into(),
            taint,
            kind: kind.into(),
        }
    }
}

/// Heuristic token count: one token per four bytes of content.
pub fn estimate_tokens(content: &str) -> u64 {
    u64::try_from(content.len() / 4).unwrap_or(u64::MAX).max(1)
}

#[derive(Debug, Default)]
struct ScopeContext {
    zones: HashMap<ContextZone, Vec<ContextItem>>,
    last_evicted: Vec<ContextItem>,
}

/// Per-scope context with zone token budgets.
#[derive(Debug)]
pub struct ContextManager {
    scopes: HashMap<String, ScopeContext>,
    zone_budget: u64,
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new(DEFAULT_ZONE_BUDGET)
    }
}

impl ContextManager {
    /// Create a manager with the given per-zone token budget.
    pub fn new(zone_budget: u64) -> Self {
        Self {
            scopes: HashMap::new(),
            zone_budget,
        }
    }

    /// Add an item to a scope, evicting oldest-first past the budget.
    pub fn add(&mut self, scope_id: &str, item: ContextItem) {
        let scope = self.scopes.entry(scope_id.to_owned()).or_default();
        let zone_items = scope.zones.entry(item.zone).or_default();
        zone_items.push(item);

        let mut used: u64 = zone_items.iter().map(|i| i.token_count).sum();
        while used > self.zone_budget && zone_items.len() > 1 {
            let evicted = zone_items.remove(0);
            used = used.saturating_sub(evicted.token_count);
            scope.last_evicted.push(evicted);
        }
    }

    /// Items currently in one zone of a scope, oldest first.
    pub fn items(&self, scope_id: &str, zone: ContextZone) -> &[ContextItem] {
        self.scopes
            .get(scope_id)
            .and_then(|s| s.zones.get(&zone))
            .map_or(&[], Vec::as_slice)
    }

    /// Total tokens currently held in one zone.
    pub fn zone_tokens(&self, scope_id: &str, zone: ContextZone) -> u64 {
        self.items(scope_id, zone).iter().map(|i| i.token_count).sum()
    }

    /// Drain items evicted since the last call, for memory persistence.
    pub fn take_last_evicted(&mut self, scope_id: &str) -> Vec<ContextItem> {
        self.scopes
            .get_mut(scope_id)
            .map(|s| std::mem::take(&mut s.last_evicted))
            .unwrap_or_default()
    }

    /// Drop a scope's entire context.
    pub fn clear_scope(&mut self, scope_id: &str) {
        self.scopes.remove(scope_id);
    }
}
