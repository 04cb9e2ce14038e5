//! Worker backend contract.
//!
//! The backend performs the actual stage work and reports a structured
//! outcome. The orchestrator only consumes that result; the backend's own
//! retry and timeout policy lives outside this crate.

mod http;

pub use http::HttpWorkerBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::cycle::ContinuationContext;
use crate::mission::StageOutcome;
use crate::pipeline::ResourcePolicy;

#[derive(Debug, Error)]
pub enum BackendError {
    /// No response at all (timeout, connection refused). Distinct from a
    /// worker-reported `error` status and retryable by the caller; the
    /// orchestrator never mutates mission state on this condition.
    #[error("worker backend did not respond")]
    Silence,

    #[error("worker backend request failed: {0}")]
    Request(String),

    #[error("worker backend returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// Everything the backend needs to execute one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageRequest {
    pub mission_id: Uuid,
    pub stage: String,
    pub problem_statement: String,
    pub continuation: ContinuationContext,
    /// Contextual hints from the knowledge cache; opaque to the core.
    pub knowledge_hints: serde_json::Value,
    /// Per-stage sandbox policy, passed through for enforcement outside.
    pub resource_policy: ResourcePolicy,
}

/// Structured response for a completed stage.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerResponse {
    pub status: StageOutcome,
    #[serde(default)]
    pub output: serde_json::Value,
    /// Stage the backend wants next; validated against the pipeline.
    #[serde(default)]
    pub next_stage_hint: Option<String>,
}

#[async_trait]
pub trait WorkerBackend: Send + Sync {
    async fn execute_stage(&self, request: &StageRequest) -> Result<WorkerResponse, BackendError>;
}
