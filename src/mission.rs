//! Mission record and lifecycle types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mission status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Active,
    Complete,
    Failed,
}

impl std::fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome a worker backend declares for a completed stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Success,
    NeedsRevision,
    NeedsReplanning,
    Error,
}

impl std::fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::NeedsRevision => write!(f, "needs_revision"),
            Self::NeedsReplanning => write!(f, "needs_replanning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One entry in a mission's append-only transition history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Stage the mission was in when the worker response arrived.
    pub from: String,
    /// Stage the mission moved to.
    pub to: String,
    pub outcome: StageOutcome,
    pub timestamp: DateTime<Utc>,
    /// Triggering payload, retained for failed transitions (post-mortem).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// Specification a mission is created from (queue payload or direct start).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionSpec {
    pub problem_statement: String,
    pub cycle_budget: u32,
    /// Higher priority dequeues first; ties break by enqueue time.
    #[serde(default)]
    pub priority: i32,
    /// Where this work item came from (operator, webhook, scheduler, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// A unit of multi-stage work tracked by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub id: Uuid,
    pub problem_statement: String,
    pub current_stage: String,
    pub current_cycle: u32,
    pub cycle_budget: u32,
    /// Count of revision/replanning loops. Never moves on a plain success.
    pub iteration: u32,
    pub status: MissionStatus,
    /// Append-only; extended by validated transitions, never rewritten.
    pub history: Vec<TransitionRecord>,
    /// Whether the current traversal has already been counted against the
    /// cycle budget. Cleared whenever the mission re-enters the initial stage.
    #[serde(default)]
    pub cycle_credited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Why the mission was forced to a terminal state, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Mission {
    /// Create a fresh mission at the pipeline's initial stage.
    pub fn new(spec: &MissionSpec, initial_stage: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            problem_statement: spec.problem_statement.clone(),
            current_stage: initial_stage.to_string(),
            current_cycle: 0,
            // A mission always gets at least one cycle.
            cycle_budget: spec.cycle_budget.max(1),
            iteration: 0,
            status: MissionStatus::Active,
            history: Vec::new(),
            cycle_credited: false,
            source: spec.source.clone(),
            terminal_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == MissionStatus::Active
    }

    /// Stage names visited so far, starting at the initial stage.
    pub fn stage_trace(&self) -> Vec<String> {
        let mut trace = Vec::with_capacity(self.history.len() + 1);
        match self.history.first() {
            Some(first) => trace.push(first.from.clone()),
            None => trace.push(self.current_stage.clone()),
        }
        for record in &self.history {
            if trace.last().map_or(true, |last| *last != record.to) {
                trace.push(record.to.clone());
            }
        }
        trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> MissionSpec {
        MissionSpec {
            problem_statement: "add dark mode".to_string(),
            cycle_budget: 3,
            priority: 0,
            source: None,
        }
    }

    #[test]
    fn new_mission_starts_at_initial_stage() {
        let mission = Mission::new(&spec(), "plan");
        assert_eq!(mission.current_stage, "plan");
        assert_eq!(mission.current_cycle, 0);
        assert_eq!(mission.iteration, 0);
        assert!(mission.is_active());
        assert!(mission.history.is_empty());
    }

    #[test]
    fn stage_trace_follows_history() {
        let mut mission = Mission::new(&spec(), "plan");
        let now = Utc::now();
        for (from, to) in [("plan", "build"), ("build", "test"), ("test", "build")] {
            mission.history.push(TransitionRecord {
                from: from.to_string(),
                to: to.to_string(),
                outcome: StageOutcome::Success,
                timestamp: now,
                detail: None,
            });
        }
        assert_eq!(mission.stage_trace(), vec!["plan", "build", "test", "build"]);
    }
}
