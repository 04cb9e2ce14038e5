//! Lifecycle events dispatched to integrations.
//!
//! Events are ephemeral: the core emits them after a transition has been
//! durably persisted and never stores them itself. Persistence, if any, is
//! an integration's concern.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::mission::StageOutcome;

/// Kinds of lifecycle events, used for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StageStarted,
    StageCompleted,
    MissionStarted,
    MissionCompleted,
    CycleCompleted,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::StageStarted,
        EventKind::StageCompleted,
        EventKind::MissionStarted,
        EventKind::MissionCompleted,
        EventKind::CycleCompleted,
        EventKind::Error,
    ];
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StageStarted => write!(f, "stage_started"),
            Self::StageCompleted => write!(f, "stage_completed"),
            Self::MissionStarted => write!(f, "mission_started"),
            Self::MissionCompleted => write!(f, "mission_completed"),
            Self::CycleCompleted => write!(f, "cycle_completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Typed payload per event kind. Only `Error` carries an opaque map, for
/// plugin-specific context that has no fixed shape.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventData {
    StageStarted {
        stage: String,
        cycle: u32,
        iteration: u32,
    },
    StageCompleted {
        stage: String,
        outcome: StageOutcome,
        output: serde_json::Value,
    },
    MissionStarted {
        problem_statement: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    MissionCompleted {
        cycles: u32,
        iterations: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        terminal_reason: Option<String>,
    },
    CycleCompleted {
        cycle: u32,
        exhausted: bool,
    },
    Error {
        message: String,
        context: serde_json::Map<String, serde_json::Value>,
    },
}

impl EventData {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StageStarted { .. } => EventKind::StageStarted,
            Self::StageCompleted { .. } => EventKind::StageCompleted,
            Self::MissionStarted { .. } => EventKind::MissionStarted,
            Self::MissionCompleted { .. } => EventKind::MissionCompleted,
            Self::CycleCompleted { .. } => EventKind::CycleCompleted,
            Self::Error { .. } => EventKind::Error,
        }
    }
}

/// Envelope delivered to integrations. The core guarantees these fields;
/// `data` contents are defined by whichever transition produced them.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub mission_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub data: EventData,
}

impl Event {
    pub fn new(
        mission_id: Uuid,
        stage: Option<String>,
        timestamp: DateTime<Utc>,
        data: EventData,
    ) -> Self {
        Self {
            kind: data.kind(),
            mission_id,
            stage,
            timestamp,
            data,
        }
    }
}

/// Assigns emission timestamps, monotonic non-decreasing per mission.
///
/// Wall-clock time can step backwards (NTP adjustments); integrations are
/// promised ordered timestamps, so the clock clamps to the last value seen.
#[derive(Debug, Default)]
pub struct EventClock {
    last: Mutex<HashMap<Uuid, DateTime<Utc>>>,
}

impl EventClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stamp(&self, mission_id: Uuid) -> DateTime<Utc> {
        let now = Utc::now();
        let mut last = self.last.lock().await;
        let entry = last.entry(mission_id).or_insert(now);
        if now > *entry {
            *entry = now;
        }
        *entry
    }

    /// Drop tracking for a finished mission.
    pub async fn forget(&self, mission_id: Uuid) {
        self.last.lock().await.remove(&mission_id);
    }
}
