//! Drives the worker backend request/response loop.
//!
//! The runner is the caller the orchestrator leaves retry policy to: a
//! silent backend is retried with a delay, a worker-declared outcome is
//! handed to `process_response`, and when a mission ends the loop simply
//! continues with whatever mission the auto-drain promoted next.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::backend::{BackendError, StageRequest, WorkerBackend};
use crate::knowledge::KnowledgeCache;
use crate::mission::Mission;
use crate::orchestrator::StageOrchestrator;

/// Query against the external knowledge base, used to fill the cache on a
/// miss. The key is `{mission_id}:{stage}`.
pub type KnowledgeQuery = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, String>> + Send>>
        + Send
        + Sync,
>;

pub struct MissionRunner {
    orchestrator: Arc<StageOrchestrator>,
    backend: Arc<dyn WorkerBackend>,
    knowledge: Arc<KnowledgeCache>,
    knowledge_query: Option<KnowledgeQuery>,
    silence_retries: u32,
    retry_delay: Duration,
    // Held by the drive loop; `spawn` is a no-op while a loop is running.
    running: Mutex<()>,
}

impl MissionRunner {
    pub fn new(
        orchestrator: Arc<StageOrchestrator>,
        backend: Arc<dyn WorkerBackend>,
        knowledge: Arc<KnowledgeCache>,
    ) -> Self {
        Self {
            orchestrator,
            backend,
            knowledge,
            knowledge_query: None,
            silence_retries: 3,
            retry_delay: Duration::from_secs(2),
            running: Mutex::new(()),
        }
    }

    pub fn with_knowledge_query(mut self, query: KnowledgeQuery) -> Self {
        self.knowledge_query = Some(query);
        self
    }

    pub fn with_silence_policy(mut self, retries: u32, delay: Duration) -> Self {
        self.silence_retries = retries;
        self.retry_delay = delay;
        self
    }

    /// Start the drive loop in the background unless one is already running.
    pub fn spawn(self: &Arc<Self>) {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            let Ok(_guard) = runner.running.try_lock() else {
                debug!("mission runner already active");
                return;
            };
            if let Err(err) = runner.drive().await {
                error!("mission runner stopped: {err:#}");
            }
        });
    }

    /// Drive missions until nothing is active and the backlog is empty.
    pub async fn drive(&self) -> anyhow::Result<()> {
        loop {
            let Some(mission) = self.orchestrator.active_mission().await else {
                match self.orchestrator.drain_next().await? {
                    Some(_) => continue,
                    None => {
                        debug!("no active mission and empty backlog; runner going idle");
                        return Ok(());
                    }
                }
            };
            self.step(&mission).await?;
        }
    }

    async fn step(&self, mission: &Mission) -> anyhow::Result<()> {
        let request = self.build_request(mission).await;

        let mut silences = 0u32;
        let response = loop {
            match self.backend.execute_stage(&request).await {
                Ok(response) => break response,
                Err(BackendError::Silence) => {
                    silences += 1;
                    if silences > self.silence_retries {
                        anyhow::bail!(
                            "worker backend silent after {silences} attempts for stage {}",
                            request.stage
                        );
                    }
                    warn!(
                        mission = %mission.id,
                        stage = %request.stage,
                        attempt = silences,
                        "worker backend silent; retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(err) => return Err(err.into()),
            }
        };

        match self.orchestrator.process_response(mission.id, response).await {
            Ok(outcome) => {
                debug!(mission = %mission.id, ?outcome, "processed worker response");
                Ok(())
            }
            // Invalid transitions and persistence failures leave the mission
            // active and untouched; stop driving and surface the error so an
            // operator (or a retry) can pick it up.
            Err(err) => Err(err.into()),
        }
    }

    async fn build_request(&self, mission: &Mission) -> StageRequest {
        let continuation = self.orchestrator.continuation_context(mission);
        let resource_policy = self
            .orchestrator
            .pipeline()
            .resource_policy(&mission.current_stage)
            .cloned()
            .unwrap_or_default();

        let knowledge_hints = match &self.knowledge_query {
            Some(query) => {
                let key = format!("{}:{}", mission.id, mission.current_stage);
                let query = Arc::clone(query);
                let lookup_key = key.clone();
                self.knowledge
                    .get_or_compute(&key, move || query(lookup_key))
                    .await
                    .unwrap_or_else(|err| {
                        warn!("knowledge lookup failed, continuing without hints: {err}");
                        serde_json::Value::Null
                    })
            }
            None => serde_json::Value::Null,
        };

        StageRequest {
            mission_id: mission.id,
            stage: mission.current_stage.clone(),
            problem_statement: mission.problem_statement.clone(),
            continuation,
            knowledge_hints,
            resource_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::WorkerResponse;
    use crate::integrations::IntegrationManager;
    use crate::mission::{MissionSpec, MissionStatus, StageOutcome};
    use crate::pipeline::Pipeline;
    use crate::queue::MissionQueue;
    use crate::store::InMemoryMissionStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Backend that replays a scripted sequence of results.
    struct ScriptedBackend {
        script: StdMutex<VecDeque<Result<WorkerResponse, BackendError>>>,
        calls: StdMutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<WorkerResponse, BackendError>>) -> Self {
            Self {
                script: StdMutex::new(script.into()),
                calls: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl WorkerBackend for ScriptedBackend {
        async fn execute_stage(
            &self,
            request: &StageRequest,
        ) -> Result<WorkerResponse, BackendError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push(request.stage.clone());
            self.script
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or(Err(BackendError::Silence))
        }
    }

    fn success() -> Result<WorkerResponse, BackendError> {
        Ok(WorkerResponse {
            status: StageOutcome::Success,
            output: serde_json::Value::Null,
            next_stage_hint: None,
        })
    }

    fn spec(budget: u32) -> MissionSpec {
        MissionSpec {
            problem_statement: "wire up the importer".into(),
            cycle_budget: budget,
            priority: 0,
            source: None,
        }
    }

    async fn orchestrator_with_store() -> (Arc<StageOrchestrator>, Arc<MissionQueue>) {
        let queue = Arc::new(MissionQueue::ephemeral());
        let orchestrator = Arc::new(StageOrchestrator::new(
            Arc::new(Pipeline::default_pipeline()),
            Arc::new(InMemoryMissionStore::new()),
            Arc::new(IntegrationManager::new()),
            Arc::clone(&queue),
        ));
        (orchestrator, queue)
    }

    #[tokio::test]
    async fn drives_a_mission_to_completion() {
        let (orchestrator, _queue) = orchestrator_with_store().await;
        let mission = orchestrator.start_mission(&spec(1)).await.expect("start");

        let backend = Arc::new(ScriptedBackend::new(vec![success(), success()]));
        let runner = MissionRunner::new(
            Arc::clone(&orchestrator),
            backend.clone(),
            Arc::new(KnowledgeCache::new(8, Duration::from_secs(60))),
        );

        runner.drive().await.expect("drive");

        assert!(orchestrator.active_mission().await.is_none());
        let stored = orchestrator
            .mission(mission.id)
            .await
            .expect("get")
            .expect("mission stored");
        assert_eq!(stored.status, MissionStatus::Complete);
        assert_eq!(
            backend.calls.lock().expect("calls lock").clone(),
            vec!["plan", "build"]
        );
    }

    #[tokio::test]
    async fn chains_queued_missions_without_operator_input() {
        let (orchestrator, queue) = orchestrator_with_store().await;
        queue.enqueue(spec(1)).await.expect("enqueue");
        queue.enqueue(spec(1)).await.expect("enqueue");

        // Two missions, two worker calls each.
        let backend = Arc::new(ScriptedBackend::new(vec![
            success(),
            success(),
            success(),
            success(),
        ]));
        let runner = MissionRunner::new(
            Arc::clone(&orchestrator),
            backend.clone(),
            Arc::new(KnowledgeCache::new(8, Duration::from_secs(60))),
        );

        runner.drive().await.expect("drive");

        assert!(orchestrator.active_mission().await.is_none());
        assert!(queue.pending().await.is_empty());
        assert_eq!(backend.calls.lock().expect("calls lock").len(), 4);
    }

    #[tokio::test]
    async fn persistent_silence_leaves_the_mission_untouched() {
        let (orchestrator, _queue) = orchestrator_with_store().await;
        let mission = orchestrator.start_mission(&spec(1)).await.expect("start");

        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(BackendError::Silence),
            Err(BackendError::Silence),
        ]));
        let runner = MissionRunner::new(
            Arc::clone(&orchestrator),
            backend,
            Arc::new(KnowledgeCache::new(8, Duration::from_secs(60))),
        )
        .with_silence_policy(1, Duration::from_millis(1));

        runner.drive().await.expect_err("backend never answered");

        // Distinct from a worker error: nothing was mutated.
        let active = orchestrator.active_mission().await.expect("still active");
        assert_eq!(active.current_stage, "plan");
        assert!(active.history.is_empty());
        assert_eq!(active.status, MissionStatus::Active);
        assert_eq!(active.id, mission.id);
    }
}
