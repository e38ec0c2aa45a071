// In-memory project store with a per-project snapshot journal

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::ProjectStore;
use crate::project::{Project, ProjectId};

/// Keeps the latest record plus every version ever saved, oldest first.
#[derive(Default)]
pub struct InMemoryProjectStore {
    projects: RwLock<HashMap<ProjectId, Project>>,
    journal: RwLock<HashMap<ProjectId, Vec<Project>>>,
}

impl InMemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every saved version of `id`, oldest first
    pub async fn snapshots(&self, id: &ProjectId) -> Vec<Project> {
        self.journal
            .read()
            .await
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn save_count(&self, id: &ProjectId) -> usize {
        self.journal.read().await.get(id).map_or(0, Vec::len)
    }
}

#[async_trait]
impl ProjectStore for InMemoryProjectStore {
    async fn save(&self, project: &Project) -> Result<()> {
        self.projects
            .write()
            .await
            .insert(project.id.clone(), project.clone());
        self.journal
            .write()
            .await
            .entry(project.id.clone())
            .or_default()
            .push(project.clone());
        Ok(())
    }

    async fn load(&self, id: &ProjectId) -> Result<Option<Project>> {
        Ok(self.projects.read().await.get(id).cloned())
    }

    async fn list_for_owner(&self, owner: &str) -> Result<Vec<Project>> {
        Ok(self
            .projects
            .read()
            .await
            .values()
            .filter(|p| p.owner == owner)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_journal_records_every_save() {
        let store = InMemoryProjectStore::new();
        let mut project = Project::new("o", "n");
        store.save(&project).await.unwrap();
        project.artifact.html = "<p>".into();
        store.save(&project).await.unwrap();

        let snapshots = store.snapshots(&project.id).await;
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots[0].artifact.html.is_empty());
        assert_eq!(
            store.load(&project.id).await.unwrap().unwrap().artifact.html,
            "<p>"
        );
    }
}
