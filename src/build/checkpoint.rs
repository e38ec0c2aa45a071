// Checkpointer — the build job's working copy of the project plus its commit point

use anyhow::{Context, Result};
use chrono::Utc;

use crate::project::{BuildState, Message, Project, ProjectId};
use crate::store::ProjectStore;

/// Owns the project record for the duration of a build.
///
/// Mutations happen on the in-memory copy; `commit` writes the whole record.
/// Callers commit after every transition and before the next suspend point.
pub struct Checkpointer<'a> {
    store: &'a dyn ProjectStore,
    project: Project,
}

impl<'a> Checkpointer<'a> {
    pub async fn load(store: &'a dyn ProjectStore, id: &ProjectId) -> Result<Checkpointer<'a>> {
        let project = store
            .load(id)
            .await?
            .with_context(|| format!("Project {id} not found"))?;
        Ok(Self { store, project })
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn project_mut(&mut self) -> &mut Project {
        &mut self.project
    }

    pub fn build_state(&self) -> Option<&BuildState> {
        self.project.build_state.as_ref()
    }

    pub fn build_state_mut(&mut self) -> Option<&mut BuildState> {
        self.project.build_state.as_mut()
    }

    pub fn push_message(&mut self, message: Message) {
        self.project.push_message(message);
    }

    /// Persist the full record
    pub async fn commit(&mut self) -> Result<()> {
        self.project.updated_at = Utc::now();
        self.store
            .save(&self.project)
            .await
            .with_context(|| format!("Failed to checkpoint project {}", self.project.id))?;
        tracing::debug!(
            "Checkpoint {}: step {:?}",
            self.project.id,
            self.project
                .build_state
                .as_ref()
                .map(|s| (s.current_step, s.last_completed_step))
        );
        Ok(())
    }

    /// Pick up backend changes made outside this job (provisioning, manual connect)
    pub async fn refresh_backend(&mut self) -> Result<()> {
        if let Some(latest) = self.store.load(&self.project.id).await? {
            self.project.backend = latest.backend;
        }
        Ok(())
    }

    pub fn into_project(self) -> Project {
        self.project
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{BackendConnection, Project};
    use crate::store::InMemoryProjectStore;

    #[tokio::test]
    async fn test_commit_persists_working_copy() {
        let store = InMemoryProjectStore::new();
        let project = Project::new("eve", "demo");
        store.save(&project).await.unwrap();

        let mut checkpoint = Checkpointer::load(&store, &project.id).await.unwrap();
        checkpoint.push_message(Message::system("hello"));
        assert!(store.load(&project.id).await.unwrap().unwrap().messages.is_empty());

        checkpoint.commit().await.unwrap();
        let saved = store.load(&project.id).await.unwrap().unwrap();
        assert_eq!(saved.messages.len(), 1);
        assert_eq!(store.save_count(&project.id).await, 2);
    }

    #[tokio::test]
    async fn test_refresh_backend_keeps_local_changes() {
        let store = InMemoryProjectStore::new();
        let project = Project::new("eve", "demo");
        store.save(&project).await.unwrap();

        let mut checkpoint = Checkpointer::load(&store, &project.id).await.unwrap();
        checkpoint.push_message(Message::system("local"));

        let mut external = project.clone();
        external.backend = Some(BackendConnection::Manual {
            url: "sqlite:///tmp/db".into(),
            api_key: "k".into(),
        });
        store.save(&external).await.unwrap();

        checkpoint.refresh_backend().await.unwrap();
        assert!(checkpoint.project().backend_active());
        assert_eq!(checkpoint.project().messages.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_project_errors() {
        let store = InMemoryProjectStore::new();
        assert!(Checkpointer::load(&store, &"nope".to_string()).await.is_err());
    }
}
