// Local backend: one SQLite file per provisioned database

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use super::{Provisioner, SqlExecutor};
use crate::project::{BackendConnection, ManagedBackend, ProvisioningStatus};

const SCHEME: &str = "sqlite://";

/// Provisions SQLite databases under `root`.
///
/// Creation runs on a blocking task whose result is recorded per reference;
/// `refresh` reports `active` or `failed` once it lands. A reference this
/// provisioner never created falls back to checking for the file. Local
/// databases have no auth, so the reference doubles as the key.
pub struct LocalProvisioner {
    root: PathBuf,
    /// reference -> creation error, `None` once created
    settled: Arc<DashMap<String, Option<String>>>,
}

impl LocalProvisioner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            settled: Arc::new(DashMap::new()),
        }
    }

    fn db_path(&self, reference: &str) -> PathBuf {
        self.root.join(format!("{reference}.db"))
    }
}

fn create_database(root: &Path, path: &Path) -> Result<()> {
    std::fs::create_dir_all(root)
        .with_context(|| format!("Failed to create {}", root.display()))?;
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(())
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    async fn request_backend(&self, owner: &str) -> Result<ManagedBackend> {
        let reference = format!("{}-{}", sanitize(owner), Uuid::new_v4().simple());
        let path = self.db_path(&reference);
        let root = self.root.clone();
        let settled = self.settled.clone();
        let key = reference.clone();

        tokio::task::spawn_blocking(move || match create_database(&root, &path) {
            Ok(()) => {
                settled.insert(key, None);
            }
            Err(e) => {
                tracing::error!("Failed to create local backend {}: {:#}", path.display(), e);
                settled.insert(key, Some(format!("{e:#}")));
            }
        });

        Ok(ManagedBackend {
            reference,
            status: ProvisioningStatus::Creating,
            url: None,
            api_key: None,
        })
    }

    async fn refresh(&self, backend: &ManagedBackend) -> Result<ManagedBackend> {
        if backend.status != ProvisioningStatus::Creating {
            return Ok(backend.clone());
        }
        let path = self.db_path(&backend.reference);
        let created = match self.settled.get(&backend.reference).map(|e| e.value().clone()) {
            Some(None) => true,
            Some(Some(_)) => {
                return Ok(ManagedBackend {
                    status: ProvisioningStatus::Failed,
                    ..backend.clone()
                })
            }
            None => path.exists(),
        };
        if !created {
            return Ok(backend.clone());
        }
        Ok(ManagedBackend {
            status: ProvisioningStatus::Active,
            url: Some(format!("{SCHEME}{}", path.display())),
            api_key: Some(backend.reference.clone()),
            ..backend.clone()
        })
    }
}

/// Executes SQL against `sqlite://` backends
#[derive(Debug, Default, Clone)]
pub struct LocalSqlExecutor;

impl LocalSqlExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SqlExecutor for LocalSqlExecutor {
    async fn execute(&self, connection: &BackendConnection, sql: &str) -> Result<()> {
        let credentials = connection
            .credentials()
            .context("Backend connection is not active")?;
        let Some(path) = credentials.url.strip_prefix(SCHEME) else {
            bail!("Unsupported backend url: {}", credentials.url);
        };
        let path = Path::new(path).to_path_buf();
        let sql = sql.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)
                .with_context(|| format!("Failed to open backend {}", path.display()))?;
            conn.execute_batch(&sql).context("SQL execution failed")?;
            Ok(())
        })
        .await
        .context("SQL execution task panicked")?
    }
}

fn sanitize(owner: &str) -> String {
    let cleaned: String = owner
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(16)
        .collect::<String>()
        .to_lowercase();
    if cleaned.is_empty() {
        "project".to_string()
    } else {
        cleaned
    }
}
