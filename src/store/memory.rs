//! In-memory mission store (non-persistent).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{MissionStore, StoreError};
use crate::mission::Mission;

#[derive(Clone, Default)]
pub struct InMemoryMissionStore {
    missions: Arc<RwLock<HashMap<Uuid, Mission>>>,
    archived: Arc<RwLock<HashMap<Uuid, Mission>>>,
}

impl InMemoryMissionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MissionStore for InMemoryMissionStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn create(&self, mission: &Mission) -> Result<(), StoreError> {
        let mut missions = self.missions.write().await;
        if missions.contains_key(&mission.id) {
            return Err(StoreError::AlreadyExists(mission.id));
        }
        missions.insert(mission.id, mission.clone());
        Ok(())
    }

    async fn save(&self, mission: &Mission) -> Result<(), StoreError> {
        let mut missions = self.missions.write().await;
        if !missions.contains_key(&mission.id) {
            return Err(StoreError::NotFound(mission.id));
        }
        missions.insert(mission.id, mission.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Mission>, StoreError> {
        Ok(self.missions.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Mission>, StoreError> {
        let mut missions: Vec<Mission> = self.missions.read().await.values().cloned().collect();
        missions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(missions)
    }

    async fn archive(&self, id: Uuid) -> Result<(), StoreError> {
        let mut missions = self.missions.write().await;
        let mission = missions.remove(&id).ok_or(StoreError::NotFound(id))?;
        drop(missions);
        self.archived.write().await.insert(id, mission);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mission::MissionSpec;

    fn mission() -> Mission {
        Mission::new(
            &MissionSpec {
                problem_statement: "task".into(),
                cycle_budget: 1,
                priority: 0,
                source: None,
            },
            "plan",
        )
    }

    #[tokio::test]
    async fn save_requires_created_record() {
        let store = InMemoryMissionStore::new();
        let m = mission();
        assert!(matches!(
            store.save(&m).await,
            Err(StoreError::NotFound(id)) if id == m.id
        ));
        store.create(&m).await.expect("create");
        store.save(&m).await.expect("save");
    }

    #[tokio::test]
    async fn archive_removes_from_listing() {
        let store = InMemoryMissionStore::new();
        let m = mission();
        store.create(&m).await.expect("create");
        store.archive(m.id).await.expect("archive");
        assert!(store.get(m.id).await.expect("get").is_none());
        assert!(store.list().await.expect("list").is_empty());
    }
}
