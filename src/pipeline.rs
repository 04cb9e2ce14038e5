//! Stage pipeline definitions and transition lookup.
//!
//! The pipeline is a pure lookup structure loaded once at startup, either
//! from a JSON definition file (`PIPELINE_PATH`) or the built-in default.
//! It is never mutated at runtime; only integration plugins are
//! hot-reloadable, not the pipeline shape itself.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to read pipeline file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pipeline definition: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("pipeline has no stages")]
    Empty,

    #[error("duplicate stage: {0}")]
    DuplicateStage(String),

    #[error("unknown stage referenced: {0}")]
    UnknownStage(String),

    #[error("non-terminal stage {0} has no outgoing edge")]
    DeadEnd(String),

    #[error("terminal stage {0} must not have a successor")]
    TerminalHasSuccessor(String),
}

/// Per-stage resource access policy, consumed by the execution sandbox.
/// The orchestrator passes it through; enforcement happens outside.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourcePolicy {
    #[serde(default)]
    pub allowed_write_paths: Vec<String>,
    #[serde(default)]
    pub blocked_capabilities: Vec<String>,
}

/// A named phase in the mission pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    /// Stages allowed to precede this one.
    #[serde(default)]
    pub valid_from: Vec<String>,
    /// Successor in pipeline order. None only for the terminal stage.
    #[serde(default)]
    pub next: Option<String>,
    /// Where `needs_revision` sends the mission from this stage.
    /// Falls back to the pipeline-level revision stage when unset.
    #[serde(default)]
    pub revision_target: Option<String>,
    #[serde(default)]
    pub resource_policy: ResourcePolicy,
}

/// Serialized pipeline shape (the on-disk form).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub initial: String,
    pub terminal: String,
    /// Stage whose entry marks the end of a cycle traversal.
    pub cycle_boundary: String,
    /// Default `needs_revision` target for stages without their own.
    pub revision_stage: String,
    pub stages: Vec<StageDefinition>,
}

/// Validated, immutable stage registry.
#[derive(Debug)]
pub struct Pipeline {
    stages: HashMap<String, StageDefinition>,
    initial: String,
    terminal: String,
    cycle_boundary: String,
    revision_stage: String,
}

impl Pipeline {
    /// Validate a pipeline spec and build the registry.
    pub fn from_spec(spec: PipelineSpec) -> Result<Self, PipelineError> {
        if spec.stages.is_empty() {
            return Err(PipelineError::Empty);
        }

        let mut stages = HashMap::with_capacity(spec.stages.len());
        for stage in spec.stages {
            if stages.insert(stage.name.clone(), stage.clone()).is_some() {
                return Err(PipelineError::DuplicateStage(stage.name));
            }
        }

        // All referenced names must resolve.
        for name in [
            &spec.initial,
            &spec.terminal,
            &spec.cycle_boundary,
            &spec.revision_stage,
        ] {
            if !stages.contains_key(name) {
                return Err(PipelineError::UnknownStage(name.clone()));
            }
        }
        for stage in stages.values() {
            for from in &stage.valid_from {
                if !stages.contains_key(from) {
                    return Err(PipelineError::UnknownStage(from.clone()));
                }
            }
            if let Some(next) = &stage.next {
                if !stages.contains_key(next) {
                    return Err(PipelineError::UnknownStage(next.clone()));
                }
            }
            if let Some(target) = &stage.revision_target {
                if !stages.contains_key(target) {
                    return Err(PipelineError::UnknownStage(target.clone()));
                }
            }
        }

        // Exactly one terminal stage: the designated one, and no other stage
        // may lack an outgoing edge.
        for stage in stages.values() {
            if stage.next.is_none() && stage.name != spec.terminal {
                return Err(PipelineError::DeadEnd(stage.name.clone()));
            }
            if stage.name == spec.terminal && stage.next.is_some() {
                return Err(PipelineError::TerminalHasSuccessor(spec.terminal.clone()));
            }
        }

        Ok(Self {
            stages,
            initial: spec.initial,
            terminal: spec.terminal,
            cycle_boundary: spec.cycle_boundary,
            revision_stage: spec.revision_stage,
        })
    }

    /// Load a pipeline definition from a JSON file.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let contents = std::fs::read_to_string(path).map_err(|source| PipelineError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let spec: PipelineSpec = serde_json::from_str(&contents)?;
        Self::from_spec(spec)
    }

    /// The built-in `plan -> build -> test -> done` pipeline.
    pub fn default_pipeline() -> Self {
        let spec = PipelineSpec {
            initial: "plan".to_string(),
            terminal: "done".to_string(),
            cycle_boundary: "test".to_string(),
            revision_stage: "build".to_string(),
            stages: vec![
                StageDefinition {
                    name: "plan".to_string(),
                    // Replanning can send any working stage back here,
                    // including plan itself.
                    valid_from: vec!["plan".into(), "build".into(), "test".into()],
                    next: Some("build".to_string()),
                    revision_target: None,
                    resource_policy: ResourcePolicy {
                        allowed_write_paths: vec!["notes/".to_string()],
                        blocked_capabilities: vec!["network".to_string()],
                    },
                },
                StageDefinition {
                    name: "build".to_string(),
                    valid_from: vec!["plan".into(), "build".into(), "test".into()],
                    next: Some("test".to_string()),
                    revision_target: None,
                    resource_policy: ResourcePolicy::default(),
                },
                StageDefinition {
                    name: "test".to_string(),
                    valid_from: vec!["build".into()],
                    next: Some("done".to_string()),
                    revision_target: Some("build".to_string()),
                    resource_policy: ResourcePolicy {
                        allowed_write_paths: vec![],
                        blocked_capabilities: vec!["deploy".to_string()],
                    },
                },
                StageDefinition {
                    name: "done".to_string(),
                    valid_from: vec!["test".into()],
                    next: None,
                    revision_target: None,
                    resource_policy: ResourcePolicy {
                        allowed_write_paths: vec![],
                        blocked_capabilities: vec!["write".to_string()],
                    },
                },
            ],
        };
        Self::from_spec(spec).expect("built-in pipeline is valid")
    }

    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.get(name)
    }

    /// Whether `to` is reachable from `from` per the adjacency graph.
    pub fn valid_transition(&self, from: &str, to: &str) -> bool {
        self.stages
            .get(to)
            .map(|stage| stage.valid_from.iter().any(|f| f == from))
            .unwrap_or(false)
    }

    pub fn resource_policy(&self, stage: &str) -> Option<&ResourcePolicy> {
        self.stages.get(stage).map(|s| &s.resource_policy)
    }

    /// Pipeline-order successor of a stage.
    pub fn successor(&self, stage: &str) -> Option<&str> {
        self.stages.get(stage).and_then(|s| s.next.as_deref())
    }

    /// Where `needs_revision` sends the mission from `stage`.
    pub fn revision_target(&self, stage: &str) -> &str {
        self.stages
            .get(stage)
            .and_then(|s| s.revision_target.as_deref())
            .unwrap_or(&self.revision_stage)
    }

    pub fn initial(&self) -> &str {
        &self.initial
    }

    pub fn terminal(&self) -> &str {
        &self.terminal
    }

    pub fn cycle_boundary(&self) -> &str {
        &self.cycle_boundary
    }

    pub fn is_terminal(&self, stage: &str) -> bool {
        stage == self.terminal
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.keys().map(String::as_str).collect()
    }
}
