//! Operator HTTP API.
//!
//! Minimal surface: health, mission inspection and stop/archive, queue
//! management (add, list pending, remove, reprioritize, manual drain) and
//! integration introspection/reload. The dashboard UI consuming this lives
//! elsewhere.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::backend::{HttpWorkerBackend, WorkerBackend};
use crate::config::Config;
use crate::integrations::{EventLogIntegration, IntegrationDescriptor, IntegrationManager};
use crate::knowledge::KnowledgeCache;
use crate::mission::{Mission, MissionSpec, MissionStatus};
use crate::orchestrator::{StageOrchestrator, TransitionError};
use crate::pipeline::Pipeline;
use crate::queue::{MissionQueue, QueueError, QueueItem};
use crate::runner::MissionRunner;
use crate::store::{FileMissionStore, MissionStore, StoreError};

type ApiError = (StatusCode, String);

pub struct AppState {
    orchestrator: Arc<StageOrchestrator>,
    queue: Arc<MissionQueue>,
    integrations: Arc<IntegrationManager>,
    runner: Arc<MissionRunner>,
    default_cycle_budget: u32,
}

/// Wire everything up and run the HTTP server until shutdown.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let pipeline = Arc::new(match &config.pipeline_path {
        Some(path) => Pipeline::load(path)?,
        None => Pipeline::default_pipeline(),
    });
    info!(
        initial = pipeline.initial(),
        terminal = pipeline.terminal(),
        boundary = pipeline.cycle_boundary(),
        "pipeline loaded"
    );

    std::fs::create_dir_all(&config.state_dir)?;
    let store: Arc<dyn MissionStore> = Arc::new(FileMissionStore::new(&config.state_dir)?);
    let queue = Arc::new(MissionQueue::load(
        config.state_dir.join("queue/queue.json"),
    )?);

    let integrations = Arc::new(IntegrationManager::new());
    integrations
        .register(EventLogIntegration::factory(
            config.state_dir.join("events.jsonl"),
        ))
        .await?;

    let orchestrator = Arc::new(StageOrchestrator::new(
        pipeline,
        store,
        Arc::clone(&integrations),
        Arc::clone(&queue),
    ));
    orchestrator.recover().await?;

    let backend: Arc<dyn WorkerBackend> = Arc::new(HttpWorkerBackend::new(
        config.backend_url.clone(),
        Duration::from_secs(config.backend_timeout_secs),
    )?);
    let knowledge = Arc::new(KnowledgeCache::new(
        config.knowledge_cache_capacity,
        Duration::from_secs(config.knowledge_cache_ttl_secs),
    ));
    let runner = Arc::new(MissionRunner::new(
        Arc::clone(&orchestrator),
        backend,
        knowledge,
    ));

    // Pick up a recovered mission or a pre-existing backlog right away.
    runner.spawn();

    let shutdown = CancellationToken::new();
    if let Some(secs) = config.queue_poll_secs {
        spawn_queue_poller(Arc::clone(&runner), secs, shutdown.clone());
    }

    let state = Arc::new(AppState {
        orchestrator,
        queue,
        integrations,
        runner,
        default_cycle_budget: config.default_cycle_budget,
    });

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/missions", get(list_missions))
        .route("/api/missions/:id", get(get_mission))
        .route("/api/missions/:id/stop", post(stop_mission))
        .route("/api/missions/:id/archive", post(archive_mission))
        .route("/api/queue", post(enqueue).get(list_queue))
        .route("/api/queue/drain", post(drain_queue))
        .route("/api/queue/:id", delete(remove_queue_item))
        .route("/api/queue/:id/priority", post(set_queue_priority))
        .route("/api/integrations", get(list_integrations))
        .route("/api/integrations/:name/reload", post(reload_integration))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
            info!("shutdown requested");
        })
        .await?;
    Ok(())
}

/// Background poller sharing the event-triggered drain path (and therefore
/// its lock discipline): it only ever kicks the runner.
fn spawn_queue_poller(runner: Arc<MissionRunner>, secs: u64, token: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => runner.spawn(),
            }
        }
    });
}

// ==================== Handlers ====================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn list_missions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Mission>>, ApiError> {
    let missions = state
        .orchestrator
        .missions()
        .await
        .map_err(internal_error)?;
    Ok(Json(missions))
}

async fn get_mission(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Mission>, ApiError> {
    state
        .orchestrator
        .mission(id)
        .await
        .map_err(internal_error)?
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("mission {id} not found")))
}

#[derive(Debug, Deserialize)]
struct StopMissionRequest {
    status: MissionStatus,
    #[serde(default)]
    reason: Option<String>,
}

async fn stop_mission(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<StopMissionRequest>,
) -> Result<Json<Mission>, ApiError> {
    let mission = state
        .orchestrator
        .stop_mission(id, request.status, request.reason)
        .await
        .map_err(transition_error)?;
    // A stop may have auto-promoted the next queued mission.
    state.runner.spawn();
    Ok(Json(mission))
}

async fn archive_mission(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .orchestrator
        .archive_mission(id)
        .await
        .map_err(transition_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    problem_statement: String,
    #[serde(default)]
    cycle_budget: Option<u32>,
    #[serde(default)]
    priority: Option<i32>,
    #[serde(default)]
    source: Option<String>,
}

async fn enqueue(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<QueueItem>), ApiError> {
    if request.problem_statement.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "problem_statement must not be empty".to_string(),
        ));
    }
    let spec = MissionSpec {
        problem_statement: request.problem_statement,
        cycle_budget: request.cycle_budget.unwrap_or(state.default_cycle_budget),
        priority: request.priority.unwrap_or(0),
        source: request.source,
    };
    let item = state.queue.enqueue(spec).await.map_err(queue_error)?;
    // An idle system should pick new work up without waiting for the poller.
    state.runner.spawn();
    Ok((StatusCode::CREATED, Json(item)))
}

async fn list_queue(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<QueueItem>>, ApiError> {
    Ok(Json(state.queue.pending().await))
}

#[derive(Debug, Serialize)]
struct DrainResponse {
    promoted: Option<Mission>,
}

/// Operator "start next" trigger. Racing the automatic post-completion
/// drain is fine: the loser sees `promoted: null`.
async fn drain_queue(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DrainResponse>, ApiError> {
    let promoted = state
        .orchestrator
        .drain_next()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if promoted.is_some() {
        state.runner.spawn();
    }
    Ok(Json(DrainResponse { promoted }))
}

async fn remove_queue_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<QueueItem>, ApiError> {
    let item = state.queue.remove(id).await.map_err(queue_error)?;
    Ok(Json(item))
}

#[derive(Debug, Deserialize)]
struct SetPriorityRequest {
    priority: i32,
}

async fn set_queue_priority(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<SetPriorityRequest>,
) -> Result<Json<QueueItem>, ApiError> {
    let item = state
        .queue
        .set_priority(id, request.priority)
        .await
        .map_err(queue_error)?;
    Ok(Json(item))
}

async fn list_integrations(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<IntegrationDescriptor>> {
    Json(state.integrations.descriptors().await)
}

#[derive(Debug, Serialize)]
struct ReloadResponse {
    reloaded: bool,
}

async fn reload_integration(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Json<ReloadResponse> {
    let reloaded = state.integrations.reload(&name).await;
    Json(ReloadResponse { reloaded })
}

// ==================== Error mapping ====================

fn internal_error(err: StoreError) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn transition_error(err: TransitionError) -> ApiError {
    let status = match &err {
        TransitionError::UnknownMission(_) => StatusCode::NOT_FOUND,
        TransitionError::NotActive { .. } | TransitionError::StillActive(_) => {
            StatusCode::CONFLICT
        }
        TransitionError::InvalidTransition { .. } | TransitionError::InvalidStopStatus => {
            StatusCode::BAD_REQUEST
        }
        TransitionError::Persistence(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
        TransitionError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

fn queue_error(err: QueueError) -> ApiError {
    let status = match &err {
        QueueError::NotFound(_) => StatusCode::NOT_FOUND,
        QueueError::NotPending(_) => StatusCode::CONFLICT,
        QueueError::Persist(_) | QueueError::Corrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}
