use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::manifest::ManifestId;

/// Maximum number of characters of a task description kept in logs.
pub const TASK_SNIPPET_CHARS: usize = 120;

/// Post-task report from the caller: what was offered, what was referenced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageRecord {
    pub task_snippet: String,
    pub agent_type: String,
    #[serde(default)]
    pub manifests_loaded: Vec<ManifestId>,
    #[serde(default)]
    pub manifests_used: Vec<ManifestId>,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(
        task: &str,
        agent_type: &str,
        manifests_loaded: Vec<ManifestId>,
        manifests_used: Vec<ManifestId>,
        success: bool,
    ) -> Self {
        Self {
            task_snippet: snippet(task),
            agent_type: agent_type.to_string(),
            manifests_loaded,
            manifests_used,
            success,
            timestamp: Utc::now(),
        }
    }
}

/// Summary of one routing decision, logged for later feedback correlation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingDecision {
    pub task_snippet: String,
    pub agent_type: String,
    pub chosen: Vec<ManifestId>,
    /// Composite score of every candidate considered, chosen or not.
    #[serde(default)]
    pub candidate_scores: BTreeMap<ManifestId, f64>,
    #[serde(default)]
    pub task_tags: BTreeMap<String, f64>,
    pub routing_confidence: f64,
    pub total_bytes: u64,
    pub budget_bytes: u64,
    pub over_budget: bool,
    pub empty: bool,
    #[serde(default)]
    pub timed_out: bool,
}

/// A line in the append-only usage log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageLogEntry {
    pub entry_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: UsageEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UsageEvent {
    Routing(RoutingDecision),
    Outcome(UsageRecord),
}

impl UsageLogEntry {
    pub fn new(event: UsageEvent) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            event,
        }
    }

    pub fn agent_type(&self) -> &str {
        match &self.event {
            UsageEvent::Routing(d) => &d.agent_type,
            UsageEvent::Outcome(r) => &r.agent_type,
        }
    }
}

/// Truncate a task description to a log-friendly snippet on a char boundary.
pub fn snippet(task: &str) -> String {
    let trimmed = task.trim();
    match trimmed.char_indices().nth(TASK_SNIPPET_CHARS) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snippet_truncates_on_char_boundary() {
        let long = "é".repeat(TASK_SNIPPET_CHARS + 10);
        let s = snippet(&long);
        assert!(s.ends_with("..."));
        assert_eq!(s.chars().count(), TASK_SNIPPET_CHARS + 3);
        assert_eq!(snippet("  short task "), "short task");
    }

    #[test]
    fn test_log_entry_is_tagged() {
        let rec = UsageRecord::new("fix bug", "backend", vec![], vec![], true);
        let entry = UsageLogEntry::new(UsageEvent::Outcome(rec));
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"kind\":\"outcome\""));
        let parsed: UsageLogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.agent_type(), "backend");
    }
}
