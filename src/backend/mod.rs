// Backend infrastructure: provisioning and SQL execution
//
// Provisioning is asynchronous: a requested backend starts in `creating` and is
// polled until it becomes `active` (with credentials) or `failed`.

mod local;

pub use local::{LocalProvisioner, LocalSqlExecutor};

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

use crate::project::{BackendConnection, ManagedBackend, Message, ProjectId, ProvisioningStatus};
use crate::store::ProjectStore;

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Start creating a backend for `owner`; returns the `creating` record
    async fn request_backend(&self, owner: &str) -> Result<ManagedBackend>;

    /// Current state of a previously requested backend
    async fn refresh(&self, backend: &ManagedBackend) -> Result<ManagedBackend>;
}

#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, connection: &BackendConnection, sql: &str) -> Result<()>;
}

/// Request a backend for a project and wait for it to settle.
///
/// Every observed state is persisted. Returns the last observed descriptor,
/// which is still `creating` if `timeout` elapsed first.
pub async fn provision_project(
    store: &dyn ProjectStore,
    provisioner: &dyn Provisioner,
    project_id: &ProjectId,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<ManagedBackend> {
    let mut project = store
        .load(project_id)
        .await?
        .with_context(|| format!("Project {project_id} not found"))?;

    if let Some(BackendConnection::Managed(existing)) = &project.backend {
        if existing.status == ProvisioningStatus::Active {
            tracing::info!("Project {} already has an active backend", project_id);
            return Ok(existing.clone());
        }
    }

    let mut backend = provisioner
        .request_backend(&project.owner)
        .await
        .context("Backend provisioning request failed")?;
    tracing::info!("Requested backend {} for project {}", backend.reference, project_id);

    project.backend = Some(BackendConnection::Managed(backend.clone()));
    project.updated_at = chrono::Utc::now();
    store.save(&project).await?;

    let deadline = Instant::now() + timeout;
    while backend.status == ProvisioningStatus::Creating && Instant::now() < deadline {
        tokio::time::sleep(poll_interval).await;
        let next = provisioner.refresh(&backend).await?;
        if next != backend {
            backend = next;
            project.backend = Some(BackendConnection::Managed(backend.clone()));
            project.updated_at = chrono::Utc::now();
            store.save(&project).await?;
        }
    }

    let note = match backend.status {
        ProvisioningStatus::Active => "Database connected. You can now ask for features that store data.",
        ProvisioningStatus::Failed => "Database provisioning failed. Please try again.",
        ProvisioningStatus::Creating => "Database is still being created. Check back shortly.",
    };
    tracing::info!("Backend {} settled as {:?}", backend.reference, backend.status);
    project.push_message(Message::system(note));
    project.updated_at = chrono::Utc::now();
    store.save(&project).await?;

    Ok(backend)
}
