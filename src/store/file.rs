//! File-backed mission store.
//!
//! One JSON document per mission under `{root}/missions/`. Writes go to a
//! temp file in the same directory and are renamed into place, so a crash
//! mid-write leaves the previous record intact. Archived missions move to
//! `{root}/missions/archive/`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use uuid::Uuid;

use super::{MissionStore, StoreError};
use crate::mission::Mission;

pub struct FileMissionStore {
    missions_dir: PathBuf,
    archive_dir: PathBuf,
}

impl FileMissionStore {
    /// Create a store rooted at `root`, creating directories as needed.
    pub fn new(root: &Path) -> Result<Self, StoreError> {
        let missions_dir = root.join("missions");
        let archive_dir = missions_dir.join("archive");
        std::fs::create_dir_all(&archive_dir).map_err(StoreError::Write)?;
        Ok(Self {
            missions_dir,
            archive_dir,
        })
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.missions_dir.join(format!("{id}.json"))
    }

    fn write_atomic(&self, mission: &Mission) -> Result<(), StoreError> {
        let path = self.record_path(mission.id);
        let tmp = self.missions_dir.join(format!("{}.json.tmp", mission.id));
        let contents = serde_json::to_vec_pretty(mission)?;
        std::fs::write(&tmp, contents).map_err(StoreError::Write)?;
        std::fs::rename(&tmp, &path).map_err(StoreError::Write)?;
        Ok(())
    }

    fn read_record(path: &Path) -> Result<Mission, StoreError> {
        let contents = std::fs::read_to_string(path).map_err(StoreError::Read)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[async_trait]
impl MissionStore for FileMissionStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn create(&self, mission: &Mission) -> Result<(), StoreError> {
        if self.record_path(mission.id).exists() {
            return Err(StoreError::AlreadyExists(mission.id));
        }
        self.write_atomic(mission)?;
        tracing::debug!(mission = %mission.id, "created mission record");
        Ok(())
    }

    async fn save(&self, mission: &Mission) -> Result<(), StoreError> {
        if !self.record_path(mission.id).exists() {
            return Err(StoreError::NotFound(mission.id));
        }
        self.write_atomic(mission)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Mission>, StoreError> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_record(&path).map(Some)
    }

    async fn list(&self) -> Result<Vec<Mission>, StoreError> {
        let mut missions = Vec::new();
        let entries = std::fs::read_dir(&self.missions_dir).map_err(StoreError::Read)?;
        for entry in entries {
            let entry = entry.map_err(StoreError::Read)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path) {
                Ok(mission) => missions.push(mission),
                Err(err) => {
                    tracing::warn!("skipping unreadable mission record {}: {err}", path.display());
                }
            }
        }
        missions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(missions)
    }

    async fn archive(&self, id: Uuid) -> Result<(), StoreError> {
        let path = self.record_path(id);
        if !path.exists() {
            return Err(StoreError::NotFound(id));
        }
        let target = self.archive_dir.join(format!("{id}.json"));
        std::fs::rename(&path, &target).map_err(StoreError::Write)?;
        tracing::info!(mission = %id, "archived mission record");
        Ok(())
    }
}
