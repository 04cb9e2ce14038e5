//! Configuration management for stagecoach.
//!
//! Configuration can be set via environment variables:
//! - `WORKER_BACKEND_URL` - Required. Endpoint of the worker backend that executes stages.
//! - `STATE_DIR` - Optional. Directory for mission records, the queue and the event log. Defaults to `./.stagecoach`.
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.
//! - `PIPELINE_PATH` - Optional. JSON pipeline definition; the built-in pipeline is used when unset.
//! - `BACKEND_TIMEOUT_SECS` - Optional. Per-request worker backend timeout. Defaults to `300`.
//! - `DEFAULT_CYCLE_BUDGET` - Optional. Cycle budget for queue items that don't set one. Defaults to `3`.
//! - `QUEUE_POLL_SECS` - Optional. Interval for the background queue-drain poller; the poller is disabled when unset.
//! - `KNOWLEDGE_CACHE_CAPACITY` - Optional. Max entries in the knowledge cache. Defaults to `128`.
//! - `KNOWLEDGE_CACHE_TTL_SECS` - Optional. Knowledge cache entry lifetime. Defaults to `300`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker backend endpoint
    pub backend_url: String,

    /// Directory for mission records, queue file and event log
    pub state_dir: PathBuf,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Optional pipeline definition file
    pub pipeline_path: Option<PathBuf>,

    /// Worker backend request timeout in seconds
    pub backend_timeout_secs: u64,

    /// Cycle budget applied when a queue item doesn't carry one
    pub default_cycle_budget: u32,

    /// Queue-drain poller interval; None disables the poller
    pub queue_poll_secs: Option<u64>,

    /// Knowledge cache capacity (entries)
    pub knowledge_cache_capacity: usize,

    /// Knowledge cache TTL in seconds
    pub knowledge_cache_ttl_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `WORKER_BACKEND_URL` is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend_url = std::env::var("WORKER_BACKEND_URL")
            .map_err(|_| ConfigError::MissingEnvVar("WORKER_BACKEND_URL".to_string()))?;

        let state_dir = std::env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.stagecoach"));

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{}", e)))?;

        let pipeline_path = std::env::var("PIPELINE_PATH").ok().map(PathBuf::from);

        let backend_timeout_secs = parse_env("BACKEND_TIMEOUT_SECS")?.unwrap_or(300);
        let default_cycle_budget = parse_env("DEFAULT_CYCLE_BUDGET")?.unwrap_or(3);
        let queue_poll_secs = parse_env("QUEUE_POLL_SECS")?;
        let knowledge_cache_capacity = parse_env("KNOWLEDGE_CACHE_CAPACITY")?.unwrap_or(128);
        let knowledge_cache_ttl_secs = parse_env("KNOWLEDGE_CACHE_TTL_SECS")?.unwrap_or(300);

        Ok(Self {
            backend_url,
            state_dir,
            host,
            port,
            pipeline_path,
            backend_timeout_secs,
            default_cycle_budget,
            queue_poll_secs,
            knowledge_cache_capacity,
            knowledge_cache_ttl_secs,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(backend_url: String, state_dir: PathBuf) -> Self {
        Self {
            backend_url,
            state_dir,
            host: "127.0.0.1".to_string(),
            port: 3000,
            pipeline_path: None,
            backend_timeout_secs: 300,
            default_cycle_budget: 3,
            queue_poll_secs: None,
            knowledge_cache_capacity: 128,
            knowledge_cache_ttl_secs: 300,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(None),
    }
}
