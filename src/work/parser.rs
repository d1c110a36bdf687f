//! Markdown plan parser.
//!
//! Plans arrive from the planner as markdown with a YAML front matter
//! block:
//!
//! ```text
//! ---
//! id: task-1
//! type: task
//! title: Do the thing
//! ---
//! Body markdown describing the work.
//! ```
//!
//! `id`, `type`, and `title` are required; unknown fields are rejected
//! (planner output is untrusted input, so silently ignoring fields
//! would let typos weaken constraints).

use serde::Deserialize;
use std::collections::BTreeMap;

use super::item::{
    AccessLevel, AgentLane, Budget, EscalationAction, Gate, InteractionMode, VerificationCheck,
    WorkError, WorkItem, WorkItemType,
};

const FRONT_MATTER_DELIMITER: &str = "---";
const REQUIRED_FIELDS: &[&str] = &["id", "type", "title"];

/// Typed front matter. `deny_unknown_fields` makes unknown keys a parse
/// error rather than silent acceptance.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlanFrontMatter {
    id: String,
    #[serde(rename = "type")]
    item_type: WorkItemType,
    title: String,
    parent: Option<String>,
    spawned_by: Option<String>,
    follow_up_of: Option<String>,
    domain: Option<String>,
    agent: Option<AgentLane>,
    needs_approval: Option<bool>,
    schedule: Option<String>,
    on_stuck: Option<String>,
    on_failure: Option<String>,
    failure_context: Option<String>,
    interaction_mode: Option<InteractionMode>,
    skills: Option<Vec<String>>,
    input_artifacts_from: Option<Vec<String>>,
    tasks: Option<Vec<String>>,
    depends_on: Option<Vec<String>>,
    budget: Option<Budget>,
    verify: Option<Vec<VerificationCheck>>,
    gates: Option<Vec<Gate>>,
    access_levels: Option<BTreeMap<String, AccessLevel>>,
    escalation: Option<BTreeMap<String, EscalationAction>>,
}

/// Parses plan markdown into validated [`WorkItem`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanParser;

impl PlanParser {
    /// Parse one plan document.
    pub fn parse(&self, markdown: &str) -> Result<WorkItem, WorkError> {
        let (front_matter_text, body) = split_front_matter(markdown)?;

        // Check required fields against the raw mapping first so the
        // error names what's missing instead of failing one at a time.
        let raw: serde_yaml::Value = serde_yaml::from_str(&front_matter_text)
            .map_err(|e| WorkError::Parse(format!("invalid YAML front matter: {e}")))?;
        if raw.as_mapping().is_none() {
            return Err(WorkError::Parse(
                "YAML front matter must be a mapping".to_owned(),
            ));
        }
        let missing: Vec<&str> = REQUIRED_FIELDS
            .iter()
            .filter(|field| match raw.get(**field) {
                None | Some(serde_yaml::Value::Null) => true,
                Some(serde_yaml::Value::String(s)) => s.trim().is_empty(),
                Some(_) => false,
            })
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(WorkError::Parse(format!(
                "missing required front matter fields: {}",
                missing.join(", ")
            )));
        }

        let front: PlanFrontMatter = serde_yaml::from_str(&front_matter_text)
            .map_err(|e| WorkError::Parse(format!("invalid front matter: {e}")))?;

        let mut item = WorkItem::task(front.id, front.title, body);
        item.item_type = front.item_type;
        item.parent = front.parent;
        item.spawned_by = front.spawned_by;
        item.follow_up_of = front.follow_up_of;
        item.domain = front.domain;
        if let Some(agent) = front.agent {
            item.agent = agent;
        }
        if let Some(needs_approval) = front.needs_approval {
            item.needs_approval = needs_approval;
        }
        item.schedule = front.schedule;
        if let Some(on_stuck) = front.on_stuck {
            item.on_stuck = on_stuck;
        }
        if let Some(on_failure) = front.on_failure {
            item.on_failure = on_failure;
        }
        item.failure_context = front.failure_context;
        if let Some(mode) = front.interaction_mode {
            item.interaction_mode = mode;
        }
        item.skills = front.skills.unwrap_or_default();
        item.input_artifacts_from = front.input_artifacts_from.unwrap_or_default();
        item.tasks = front.tasks.unwrap_or_default();
        item.depends_on = front.depends_on.unwrap_or_default();
        if let Some(budget) = front.budget {
            item.budget = budget;
        }
        item.verify = front.verify.unwrap_or_default();
        item.gates = front.gates.unwrap_or_default();
        item.access_levels = front.access_levels.unwrap_or_default();
        item.escalation = front.escalation.unwrap_or_default();

        item.validate_lane()?;
        Ok(item)
    }
}

/// Split a document into (front matter text, body).
fn split_front_matter(markdown: &str) -> Result<(String, String), WorkError> {
    let mut lines = markdown.lines();
    match lines.next() {
        Some(first) if first.trim() == FRONT_MATTER_DELIMITER => {}
        _ => {
            return Err(WorkError::Parse(
                "markdown must start with YAML front matter delimited by '---'".to_owned(),
            ));
        }
    }

    let remaining: Vec<&str> = lines.collect();
    let closing_index = remaining
        .iter()
        .position(|line| line.trim() == FRONT_MATTER_DELIMITER)
        .ok_or_else(|| {
            WorkError::Parse("markdown is missing a closing front matter delimiter".to_owned())
        })?;

    let front_matter = remaining[..closing_index].join("\n");
    let body = remaining
        .get(closing_index.saturating_add(1)..)
        .unwrap_or(&[])
        .join("\n")
        .trim()
        .to_owned();
    Ok((front_matter, body))
}
