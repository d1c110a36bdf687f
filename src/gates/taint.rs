//! Taint propagation through tool-call chains.
//!
//! Taint flows upward through an execution: if any input or intermediate
//! tool introduces a higher taint level, all downstream outputs inherit
//! it. A [`TaintTracker`] is a plain value owned by the executing task —
//! each concurrent work item constructs its own, so trackers can never
//! bleed state across tasks the way a process-global would.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::types::TaintLevel;

/// Tools whose output is raw external content.
const EXTERNAL_TOOLS: &[&str] = &[
    "web_search",
    "web_fetch",
    "web_browse",
    "http_request",
    "api_call",
    "email_send",
    "email_read",
];

/// Tools reading from authenticated third-party integrations.
const AUTH_TOOLS: &[&str] = &[
    "calendar_read",
    "calendar_write",
    "sharepoint_read",
    "sharepoint_write",
    "notion_read",
    "notion_write",
];

/// Shared registry of skill-declared tool taint ceilings.
///
/// Populated at skill registration; consulted before the static
/// category sets so skills can override defaults. One registry handle is
/// shared across trackers; the per-turn taint state itself lives in each
/// [`TaintTracker`].
#[derive(Debug, Clone, Default)]
pub struct ToolTaintRegistry {
    inner: Arc<RwLock<HashMap<String, TaintLevel>>>,
}

impl ToolTaintRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a tool's taint ceiling (e.g. from a loaded skill).
    pub fn declare(&self, tool_name: &str, taint: TaintLevel) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(tool_name.to_owned(), taint);
        }
    }

    /// Look up a declared ceiling.
    pub fn get(&self, tool_name: &str) -> Option<TaintLevel> {
        self.inner.read().ok().and_then(|map| map.get(tool_name).copied())
    }
}

/// Per-task taint high-water mark across a chain of tool calls.
///
/// Typical lifecycle:
///
/// ```
/// use straylight::gates::{TaintTracker, ToolTaintRegistry};
/// use straylight::types::TaintLevel;
///
/// let mut tracker = TaintTracker::new(ToolTaintRegistry::new());
/// tracker.reset();                                  // start of turn
/// tracker.on_tool_input(TaintLevel::External);      // inbound message taint
/// let out = tracker.on_tool_output("web_search");   // propagated taint
/// assert_eq!(out, TaintLevel::External);
/// ```
#[derive(Debug, Clone)]
pub struct TaintTracker {
    current: TaintLevel,
    registry: ToolTaintRegistry,
}

impl TaintTracker {
    /// New tracker at the Owner baseline, consulting `registry` for
    /// skill-declared ceilings.
    pub fn new(registry: ToolTaintRegistry) -> Self {
        Self {
            current: TaintLevel::Owner,
            registry,
        }
    }

    /// Record the taint of data flowing into the current execution.
    ///
    /// Ratchets the context taint upward if the input is less trusted
    /// than anything seen so far.
    pub fn on_tool_input(&mut self, taint: TaintLevel) {
        self.current = self.current.join(taint);
    }

    /// Compute the propagated taint of a tool's output and ratchet to it.
    ///
    /// The result joins the tool's inherent ceiling with the accumulated
    /// input taint, so taint never drops silently.
    pub fn on_tool_output(&mut self, tool_name: &str) -> TaintLevel {
        let ceiling = self.tool_ceiling(tool_name);
        self.current = self.current.join(ceiling);
        self.current
    }

    /// The current high-water mark.
    pub fn current(&self) -> TaintLevel {
        self.current
    }

    /// Restore the Owner baseline at the start of a new turn.
    ///
    /// Must be called per turn to prevent cross-turn taint leakage.
    pub fn reset(&mut self) {
        self.current = TaintLevel::Owner;
    }

    /// A tool's inherent taint ceiling.
    ///
    /// Dynamic registry first, then the static category sets; anything
    /// unlisted is an internal tool and does not escalate taint.
    fn tool_ceiling(&self, tool_name: &str) -> TaintLevel {
        if let Some(declared) = self.registry.get(tool_name) {
            return declared;
        }
        if EXTERNAL_TOOLS.contains(&tool_name) {
            return TaintLevel::External;
        }
        if AUTH_TOOLS.contains(&tool_name) {
            return TaintLevel::Auth;
        }
        TaintLevel::Owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> TaintTracker {
        TaintTracker::new(ToolTaintRegistry::new())
    }

    #[test]
    fn test_starts_at_owner() {
        assert_eq!(tracker().current(), TaintLevel::Owner);
    }

    #[test]
    fn test_input_ratchets_upward() {
        let mut t = tracker();
        t.on_tool_input(TaintLevel::Auth);
        assert_eq!(t.current(), TaintLevel::Auth);
        t.on_tool_input(TaintLevel::Owner);
        assert_eq!(t.current(), TaintLevel::Auth, "taint never decreases");
    }

    #[test]
    fn test_external_tool_escalates() {
        let mut t = tracker();
        assert_eq!(t.on_tool_output("web_search"), TaintLevel::External);
        assert_eq!(t.current(), TaintLevel::External);
    }

    #[test]
    fn test_auth_tool_ceiling() {
        let mut t = tracker();
        assert_eq!(t.on_tool_output("calendar_read"), TaintLevel::Auth);
    }

    #[test]
    fn test_internal_tool_does_not_escalate() {
        let mut t = tracker();
        assert_eq!(t.on_tool_output("memory_recall"), TaintLevel::Owner);
    }

    #[test]
    fn test_output_joins_accumulated_input() {
        let mut t = tracker();
        t.on_tool_input(TaintLevel::External);
        // Internal tool output still carries the accumulated taint.
        assert_eq!(t.on_tool_output("memory_recall"), TaintLevel::External);
    }

    #[test]
    fn test_monotonic_across_sequence() {
        let mut t = tracker();
        let mut high_water = TaintLevel::Owner;
        for step in [
            t.on_tool_output("memory_recall"),
            t.on_tool_output("calendar_read"),
            t.on_tool_output("web_fetch"),
            t.on_tool_output("memory_recall"),
        ] {
            assert!(step >= high_water, "taint must be monotonic upward");
            high_water = step;
        }
    }

    #[test]
    fn test_reset_restores_owner() {
        let mut t = tracker();
        t.on_tool_input(TaintLevel::External);
        t.reset();
        assert_eq!(t.current(), TaintLevel::Owner);
    }

    #[test]
    fn test_dynamic_registry_overrides_static() {
        let registry = ToolTaintRegistry::new();
        registry.declare("web_search", TaintLevel::Owner);
        let mut t = TaintTracker::new(registry.clone());
        assert_eq!(t.on_tool_output("web_search"), TaintLevel::Owner);

        registry.declare("custom_tool", TaintLevel::External);
        let mut t2 = TaintTracker::new(registry);
        assert_eq!(t2.on_tool_output("custom_tool"), TaintLevel::External);
    }

    #[test]
    fn test_trackers_are_isolated_per_task() {
        let registry = ToolTaintRegistry::new();
        let mut a = TaintTracker::new(registry.clone());
        let b = TaintTracker::new(registry);
        a.on_tool_input(TaintLevel::External);
        assert_eq!(b.current(), TaintLevel::Owner);
    }
}
