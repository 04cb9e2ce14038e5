//! Stage transition processing and mission auto-chaining.
//!
//! The orchestrator owns the active mission record. Every worker response
//! goes through `process_response`: the declared next stage is validated
//! against the pipeline, the updated record is durably persisted, and only
//! then do lifecycle events reach the integrations. When a mission ends,
//! the queue is drained under its lock so the backlog keeps moving without
//! an operator in the loop.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::WorkerResponse;
use crate::cycle::{ContinuationContext, CycleDecision, CycleManager};
use crate::events::{EventClock, EventData, Event};
use crate::integrations::IntegrationManager;
use crate::mission::{Mission, MissionSpec, MissionStatus, StageOutcome, TransitionRecord};
use crate::pipeline::Pipeline;
use crate::queue::MissionQueue;
use crate::store::{MissionStore, StoreError};

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("mission {0} is not the active mission")]
    UnknownMission(Uuid),

    #[error("mission {id} is not active (status: {status})")]
    NotActive { id: Uuid, status: MissionStatus },

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// The transition was not persisted; the prior state is intact and the
    /// attempt may be retried.
    #[error("transition was not persisted: {0}")]
    Persistence(#[from] StoreError),

    #[error("missions can only be stopped to complete or failed")]
    InvalidStopStatus,

    #[error("mission {0} is still active")]
    StillActive(Uuid),
}

#[derive(Debug, Error)]
pub enum DrainError {
    /// Mission creation failed partway; the queue item stays pending and
    /// the next drain retries it.
    #[error("failed to promote queue item {id}: {source}")]
    Promotion {
        id: Uuid,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("mission {0} is already active")]
    AlreadyActive(Uuid),

    #[error(transparent)]
    Persistence(#[from] StoreError),
}

/// What a processed worker response did to the mission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// Advanced to the declared next stage.
    Advanced { to: String },
    /// Returned to the revision target.
    Revision { to: String },
    /// Returned to the initial stage for replanning.
    Replanned { to: String },
    /// Reached the terminal stage (naturally or by cycle exhaustion).
    Completed,
    /// The worker reported an unrecoverable error.
    Failed,
}

pub struct StageOrchestrator {
    pipeline: Arc<Pipeline>,
    store: Arc<dyn MissionStore>,
    cycles: CycleManager,
    integrations: Arc<IntegrationManager>,
    queue: Arc<MissionQueue>,
    clock: EventClock,
    // At most one active mission; owned exclusively during a transition.
    active: Mutex<Option<Mission>>,
}

impl StageOrchestrator {
    pub fn new(
        pipeline: Arc<Pipeline>,
        store: Arc<dyn MissionStore>,
        integrations: Arc<IntegrationManager>,
        queue: Arc<MissionQueue>,
    ) -> Self {
        Self {
            pipeline,
            store,
            cycles: CycleManager::new(),
            integrations,
            queue,
            clock: EventClock::new(),
            active: Mutex::new(None),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub async fn active_mission(&self) -> Option<Mission> {
        self.active.lock().await.clone()
    }

    pub fn continuation_context(&self, mission: &Mission) -> ContinuationContext {
        self.cycles.build_continuation_context(mission)
    }

    /// Look up a mission record, active or historical.
    pub async fn mission(&self, id: Uuid) -> Result<Option<Mission>, StoreError> {
        self.store.get(id).await
    }

    /// All non-archived mission records, most recently updated first.
    pub async fn missions(&self) -> Result<Vec<Mission>, StoreError> {
        self.store.list().await
    }

    /// Move a finished mission's record aside. Active missions stay put.
    pub async fn archive_mission(&self, id: Uuid) -> Result<(), TransitionError> {
        let active = self.active.lock().await;
        if active.as_ref().is_some_and(|m| m.id == id) {
            return Err(TransitionError::StillActive(id));
        }
        self.store.archive(id).await?;
        Ok(())
    }

    /// Install the most recently updated active mission from the store,
    /// e.g. after a restart.
    pub async fn recover(&self) -> Result<Option<Mission>, StoreError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Ok(active.clone());
        }
        let missions = self.store.list().await?;
        let mut actives = missions.into_iter().filter(Mission::is_active);
        let Some(mission) = actives.next() else {
            return Ok(None);
        };
        for extra in actives {
            warn!(mission = %extra.id, "additional active mission found at startup; leaving it untouched");
        }
        info!(mission = %mission.id, stage = %mission.current_stage, "recovered active mission");
        *active = Some(mission.clone());
        Ok(Some(mission))
    }

    /// Create and start a mission directly, bypassing the queue.
    pub async fn start_mission(&self, spec: &MissionSpec) -> Result<Mission, StartError> {
        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            return Err(StartError::AlreadyActive(current.id));
        }
        let mission = Mission::new(spec, self.pipeline.initial());
        self.store.create(&mission).await?;
        *active = Some(mission.clone());
        self.emit_started(&mission).await;
        info!(mission = %mission.id, "mission started");
        Ok(mission)
    }

    /// Process one worker backend response for the active mission.
    pub async fn process_response(
        &self,
        mission_id: Uuid,
        response: WorkerResponse,
    ) -> Result<TransitionOutcome, TransitionError> {
        let mut active = self.active.lock().await;
        let mission = match active.as_mut() {
            Some(m) if m.id == mission_id => m,
            _ => return Err(TransitionError::UnknownMission(mission_id)),
        };
        if !mission.is_active() {
            return Err(TransitionError::NotActive {
                id: mission.id,
                status: mission.status,
            });
        }

        let mut updated = mission.clone();
        let from = updated.current_stage.clone();
        let now = Utc::now();
        // (stage, payload) pairs, queued until persistence succeeds.
        let mut pending: Vec<(Option<String>, EventData)> = Vec::new();

        let outcome = match response.status {
            StageOutcome::Error => {
                updated.status = MissionStatus::Failed;
                updated.terminal_reason =
                    Some("worker backend reported an unrecoverable error".to_string());
                updated.history.push(TransitionRecord {
                    from: from.clone(),
                    to: from.clone(),
                    outcome: StageOutcome::Error,
                    timestamp: now,
                    detail: Some(response.output.clone()),
                });
                pending.push((
                    Some(from.clone()),
                    EventData::Error {
                        message: format!("worker backend failed during stage {from}"),
                        context: error_context(&response.output),
                    },
                ));
                TransitionOutcome::Failed
            }

            StageOutcome::NeedsRevision | StageOutcome::NeedsReplanning => {
                let target = if response.status == StageOutcome::NeedsReplanning {
                    self.pipeline.initial().to_string()
                } else {
                    self.pipeline.revision_target(&from).to_string()
                };
                if !self.pipeline.valid_transition(&from, &target) {
                    return Err(TransitionError::InvalidTransition { from, to: target });
                }
                updated.iteration += 1;
                self.move_to(&mut updated, &from, &target, response.status, now);
                pending.push((
                    Some(from.clone()),
                    EventData::StageCompleted {
                        stage: from.clone(),
                        outcome: response.status,
                        output: response.output.clone(),
                    },
                ));
                pending.push((
                    Some(target.clone()),
                    EventData::StageStarted {
                        stage: target.clone(),
                        cycle: updated.current_cycle,
                        iteration: updated.iteration,
                    },
                ));
                if response.status == StageOutcome::NeedsRevision {
                    TransitionOutcome::Revision { to: target }
                } else {
                    TransitionOutcome::Replanned { to: target }
                }
            }

            StageOutcome::Success => {
                let mut declared = match &response.next_stage_hint {
                    Some(hint) => hint.clone(),
                    None => self
                        .pipeline
                        .successor(&from)
                        .map(str::to_string)
                        .ok_or_else(|| TransitionError::InvalidTransition {
                            from: from.clone(),
                            to: "<none>".to_string(),
                        })?,
                };
                if !self.pipeline.valid_transition(&from, &declared) {
                    return Err(TransitionError::InvalidTransition { from, to: declared });
                }

                pending.push((
                    Some(from.clone()),
                    EventData::StageCompleted {
                        stage: from.clone(),
                        outcome: StageOutcome::Success,
                        output: response.output.clone(),
                    },
                ));

                // Entering the cycle boundary ends a traversal: consult the
                // budget before honoring the transition.
                if declared == self.pipeline.cycle_boundary() {
                    let newly_credited = !updated.cycle_credited;
                    let decision = self.cycles.advance_cycle(&mut updated);
                    if newly_credited {
                        pending.push((
                            Some(declared.clone()),
                            EventData::CycleCompleted {
                                cycle: updated.current_cycle,
                                exhausted: decision == CycleDecision::Exhausted,
                            },
                        ));
                    }
                    if decision == CycleDecision::Exhausted {
                        info!(
                            mission = %updated.id,
                            cycle = updated.current_cycle,
                            budget = updated.cycle_budget,
                            "cycle budget exhausted; forcing mission to terminal stage"
                        );
                        declared = self.pipeline.terminal().to_string();
                        updated.terminal_reason = Some("cycle budget exhausted".to_string());
                    }
                }

                self.move_to(&mut updated, &from, &declared, StageOutcome::Success, now);

                if self.pipeline.is_terminal(&declared) {
                    updated.status = MissionStatus::Complete;
                    pending.push((
                        Some(declared.clone()),
                        EventData::MissionCompleted {
                            cycles: updated.current_cycle,
                            iterations: updated.iteration,
                            terminal_reason: updated.terminal_reason.clone(),
                        },
                    ));
                    TransitionOutcome::Completed
                } else {
                    pending.push((
                        Some(declared.clone()),
                        EventData::StageStarted {
                            stage: declared.clone(),
                            cycle: updated.current_cycle,
                            iteration: updated.iteration,
                        },
                    ));
                    TransitionOutcome::Advanced { to: declared }
                }
            }
        };

        updated.updated_at = now;

        // Persist before any event leaves the core. On failure the prior
        // in-memory state is untouched and the attempt is retryable.
        self.store.save(&updated).await?;
        *mission = updated.clone();

        for (stage, data) in pending {
            self.emit(updated.id, stage, data).await;
        }

        if !updated.is_active() {
            self.clock.forget(updated.id).await;
            *active = None;
            info!(mission = %updated.id, status = %updated.status, "mission ended");
            // Keep the fleet moving regardless of how this mission ended.
            if let Err(err) = self.drain_locked(&mut active).await {
                warn!("auto-drain after mission end failed: {err}");
            }
        }

        Ok(outcome)
    }

    /// Promote the next queue item if no mission is active.
    ///
    /// Safe to call from multiple paths concurrently: the loser of the race
    /// observes nothing to drain, not an error.
    pub async fn drain_next(&self) -> Result<Option<Mission>, DrainError> {
        let mut active = self.active.lock().await;
        self.drain_locked(&mut active).await
    }

    /// Force the active mission to a terminal status between transitions.
    pub async fn stop_mission(
        &self,
        mission_id: Uuid,
        status: MissionStatus,
        reason: Option<String>,
    ) -> Result<Mission, TransitionError> {
        if status == MissionStatus::Active {
            return Err(TransitionError::InvalidStopStatus);
        }
        let mut active = self.active.lock().await;
        let mission = match active.as_mut() {
            Some(m) if m.id == mission_id => m,
            _ => return Err(TransitionError::UnknownMission(mission_id)),
        };
        if !mission.is_active() {
            return Err(TransitionError::NotActive {
                id: mission.id,
                status: mission.status,
            });
        }

        let mut updated = mission.clone();
        updated.status = status;
        updated.terminal_reason = reason.clone().or_else(|| Some("stopped by operator".to_string()));
        updated.updated_at = Utc::now();
        self.store.save(&updated).await?;
        *mission = updated.clone();

        match status {
            MissionStatus::Complete => {
                self.emit(
                    updated.id,
                    Some(updated.current_stage.clone()),
                    EventData::MissionCompleted {
                        cycles: updated.current_cycle,
                        iterations: updated.iteration,
                        terminal_reason: updated.terminal_reason.clone(),
                    },
                )
                .await;
            }
            MissionStatus::Failed => {
                let mut context = serde_json::Map::new();
                if let Some(reason) = &updated.terminal_reason {
                    context.insert("reason".to_string(), serde_json::Value::String(reason.clone()));
                }
                self.emit(
                    updated.id,
                    Some(updated.current_stage.clone()),
                    EventData::Error {
                        message: "mission stopped by operator".to_string(),
                        context,
                    },
                )
                .await;
            }
            MissionStatus::Active => unreachable!("rejected above"),
        }

        self.clock.forget(updated.id).await;
        *active = None;
        info!(mission = %updated.id, status = %updated.status, "mission stopped by operator");
        if let Err(err) = self.drain_locked(&mut active).await {
            warn!("auto-drain after operator stop failed: {err}");
        }
        Ok(updated)
    }

    async fn drain_locked(
        &self,
        active: &mut Option<Mission>,
    ) -> Result<Option<Mission>, DrainError> {
        if let Some(current) = active.as_ref() {
            debug!(mission = %current.id, "drain skipped; a mission is already active");
            return Ok(None);
        }
        let Some(mut guard) = self.queue.try_drain().await else {
            return Ok(None);
        };
        let Some(item) = guard.peek().cloned() else {
            return Ok(None);
        };

        let mission = Mission::new(&item.spec, self.pipeline.initial());
        if let Err(source) = self.store.create(&mission).await {
            warn!(item = %item.id, "queue promotion failed; item stays pending: {source}");
            return Err(DrainError::Promotion {
                id: item.id,
                source,
            });
        }
        if let Err(err) = guard.commit(item.id) {
            warn!(item = %item.id, "failed to mark queue item promoted: {err}");
        }
        drop(guard);

        *active = Some(mission.clone());
        self.emit_started(&mission).await;
        info!(mission = %mission.id, item = %item.id, "promoted queue item to mission");
        Ok(Some(mission))
    }

    async fn emit_started(&self, mission: &Mission) {
        self.emit(
            mission.id,
            Some(mission.current_stage.clone()),
            EventData::MissionStarted {
                problem_statement: mission.problem_statement.clone(),
                source: mission.source.clone(),
            },
        )
        .await;
        self.emit(
            mission.id,
            Some(mission.current_stage.clone()),
            EventData::StageStarted {
                stage: mission.current_stage.clone(),
                cycle: mission.current_cycle,
                iteration: mission.iteration,
            },
        )
        .await;
    }

    async fn emit(&self, mission_id: Uuid, stage: Option<String>, data: EventData) {
        let timestamp = self.clock.stamp(mission_id).await;
        let event = Event::new(mission_id, stage, timestamp, data);
        self.integrations.dispatch(&event).await;
    }

    fn move_to(
        &self,
        mission: &mut Mission,
        from: &str,
        to: &str,
        outcome: StageOutcome,
        now: chrono::DateTime<Utc>,
    ) {
        mission.current_stage = to.to_string();
        if to == self.pipeline.initial() {
            // Back at the start: the next boundary pass is a new traversal.
            mission.cycle_credited = false;
        }
        mission.history.push(TransitionRecord {
            from: from.to_string(),
            to: to.to_string(),
            outcome,
            timestamp: now,
            detail: None,
        });
    }
}

fn error_context(output: &serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    match output {
        serde_json::Value::Object(map) => map.clone(),
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("output".to_string(), other.clone());
            map
        }
    }
}
