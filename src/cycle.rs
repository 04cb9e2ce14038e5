//! Cycle budgeting and continuation context.
//!
//! A cycle is one full pipeline traversal from the initial stage to the
//! cycle-boundary stage. The counter moves exactly once per traversal:
//! intra-cycle revision loops re-enter the boundary without another credit,
//! because the credit flag only clears when the mission passes back through
//! the initial stage.

use serde::Serialize;
use uuid::Uuid;

use crate::mission::{Mission, StageOutcome};

/// How many trailing transition outcomes the continuation context carries.
const RECENT_STEPS: usize = 8;

/// Whether the mission may start another cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleDecision {
    Continue,
    Exhausted,
}

/// Bounded summary carried into the next cycle's prompt assembly.
/// Deliberately small: counters and a short tail of outcomes, never the
/// full history.
#[derive(Debug, Clone, Serialize)]
pub struct ContinuationContext {
    pub mission_id: Uuid,
    pub cycle: u32,
    pub cycles_remaining: u32,
    pub iteration: u32,
    pub revisions: u32,
    pub replans: u32,
    pub recent_steps: Vec<RecentStep>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentStep {
    pub stage: String,
    pub outcome: StageOutcome,
}

/// Tracks cycle budget consumption and produces continuation decisions.
#[derive(Debug, Default)]
pub struct CycleManager;

impl CycleManager {
    pub fn new() -> Self {
        Self
    }

    /// Credit the current traversal against the budget and decide whether
    /// another cycle may start. Re-entry into the boundary within the same
    /// traversal (a revision loop) does not consume budget.
    pub fn advance_cycle(&self, mission: &mut Mission) -> CycleDecision {
        if !mission.cycle_credited {
            mission.current_cycle += 1;
            mission.cycle_credited = true;
        }
        if mission.current_cycle >= mission.cycle_budget {
            CycleDecision::Exhausted
        } else {
            CycleDecision::Continue
        }
    }

    pub fn build_continuation_context(&self, mission: &Mission) -> ContinuationContext {
        let revisions = mission
            .history
            .iter()
            .filter(|r| r.outcome == StageOutcome::NeedsRevision)
            .count() as u32;
        let replans = mission
            .history
            .iter()
            .filter(|r| r.outcome == StageOutcome::NeedsReplanning)
            .count() as u32;
        let recent_steps = mission
            .history
            .iter()
            .rev()
            .take(RECENT_STEPS)
            .rev()
            .map(|r| RecentStep {
                stage: r.from.clone(),
                outcome: r.outcome,
            })
            .collect();

        ContinuationContext {
            mission_id: mission.id,
            cycle: mission.current_cycle,
            cycles_remaining: mission.cycle_budget.saturating_sub(mission.current_cycle),
            iteration: mission.iteration,
            revisions,
            replans,
            recent_steps,
        }
    }
}
