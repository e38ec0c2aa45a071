// SQLite-backed project store (WAL mode, JSON document per project)

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::ProjectStore;
use crate::project::{Project, ProjectId, ProjectStatus};

pub struct SqliteProjectStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteProjectStore {
    /// Open (or create) the store at `db_path`
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self::init(conn)?;
        tracing::info!("Project store initialized: {}", db_path.display());
        Ok(store)
    }

    /// Store that lives only as long as the process
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(include_str!("schema.sql"))
            .context("Failed to apply project store schema")?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow::anyhow!("Project store connection poisoned"))?;
            f(&conn)
        })
        .await
        .context("Project store task panicked")?
    }
}

fn status_label(status: ProjectStatus) -> &'static str {
    match status {
        ProjectStatus::Idle => "idle",
        ProjectStatus::Generating => "generating",
    }
}

#[async_trait]
impl ProjectStore for SqliteProjectStore {
    async fn save(&self, project: &Project) -> Result<()> {
        let document = serde_json::to_string(project).context("Failed to serialize project")?;
        let id = project.id.clone();
        let owner = project.owner.clone();
        let status = status_label(project.status);
        let updated_at = project.updated_at.timestamp_millis();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO projects (id, owner, status, document, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    owner = excluded.owner,
                    status = excluded.status,
                    document = excluded.document,
                    updated_at = excluded.updated_at",
                params![id, owner, status, document, updated_at],
            )
            .with_context(|| format!("Failed to save project {id}"))?;
            Ok(())
        })
        .await
    }

    async fn load(&self, id: &ProjectId) -> Result<Option<Project>> {
        let id = id.clone();
        let document: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT document FROM projects WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .context("Failed to load project")
            })
            .await?;

        document
            .map(|doc| serde_json::from_str(&doc).context("Stored project document is corrupt"))
            .transpose()
    }

    async fn list_for_owner(&self, owner: &str) -> Result<Vec<Project>> {
        let owner = owner.to_string();
        let documents: Vec<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT document FROM projects WHERE owner = ?1 ORDER BY updated_at DESC",
                )?;
                let rows = stmt
                    .query_map(params![owner], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(rows)
            })
            .await?;

        documents
            .iter()
            .map(|doc| serde_json::from_str(doc).context("Stored project document is corrupt"))
            .collect()
    }
}
