// Durable project store
//
// Both operations are assumed strongly consistent for a single project id.
// A `save` is the checkpoint primitive: it must persist the whole record
// atomically before returning.

mod memory;
mod sqlite;

pub use memory::InMemoryProjectStore;
pub use sqlite::SqliteProjectStore;

use anyhow::Result;
use async_trait::async_trait;

use crate::project::{Project, ProjectId};

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn save(&self, project: &Project) -> Result<()>;

    async fn load(&self, id: &ProjectId) -> Result<Option<Project>>;

    async fn list_for_owner(&self, owner: &str) -> Result<Vec<Project>>;
}
