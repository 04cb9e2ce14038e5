//! Mission persistence.
//!
//! The orchestrator owns the active mission record; the store is the durable
//! source of truth. Every transition is written atomically before any event
//! is emitted, so observers never see a state that was not committed.

mod file;
mod memory;

pub use file::FileMissionStore;
pub use memory::InMemoryMissionStore;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::mission::Mission;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("mission {0} not found")]
    NotFound(Uuid),

    #[error("mission {0} already exists")]
    AlreadyExists(Uuid),

    #[error("failed to read mission record: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to write mission record: {0}")]
    Write(#[source] std::io::Error),

    #[error("invalid mission record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Durable mission record storage.
#[async_trait]
pub trait MissionStore: Send + Sync {
    /// Whether records survive a restart.
    fn is_persistent(&self) -> bool;

    /// Durably create a new mission record. Fails if the id exists.
    async fn create(&self, mission: &Mission) -> Result<(), StoreError>;

    /// Atomically replace an existing mission record.
    async fn save(&self, mission: &Mission) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Mission>, StoreError>;

    /// All non-archived missions, most recently updated first.
    async fn list(&self) -> Result<Vec<Mission>, StoreError>;

    /// Move a mission record aside. Missions are never deleted.
    async fn archive(&self, id: Uuid) -> Result<(), StoreError>;
}
