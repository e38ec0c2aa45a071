// Build supervisor — at most one running build per project
//
// Each build runs as a tokio task registered under its project id. Starting a
// new build for a project cancels the running one and waits for it to exit
// before the new task is spawned.

use anyhow::{Context, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::engine::{BuildEngine, BuildOutcome, BuildRequest};
use super::events::BuildObserver;
use crate::project::ProjectId;

/// Registry entry for a running job
#[derive(Clone)]
struct ActiveJob {
    id: Uuid,
    cancel: CancellationToken,
    finished: watch::Receiver<bool>,
}

impl ActiveJob {
    async fn wait_finished(mut self) {
        // A dropped sender also means the task is gone
        let _ = self.finished.wait_for(|done| *done).await;
    }
}

enum JobKind {
    Run(BuildRequest),
    Resume,
}

/// Handle to a spawned build
pub struct BuildJob {
    id: Uuid,
    project_id: ProjectId,
    cancel: CancellationToken,
    handle: JoinHandle<Result<BuildOutcome>>,
}

impl BuildJob {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    /// Ask the build to stop at its next checkpoint
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn wait(self) -> Result<BuildOutcome> {
        self.handle.await.context("Build task panicked")?
    }

    /// Let the build keep running without holding its handle
    pub fn detach(self) {
        tracing::debug!("Detached build {} for {}", self.id, self.project_id);
    }
}

#[derive(Clone)]
pub struct BuildSupervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    engine: Arc<BuildEngine>,
    jobs: Arc<DashMap<ProjectId, ActiveJob>>,
    /// Serializes the cancel-await-spawn sequence
    start_lock: Mutex<()>,
}

impl BuildSupervisor {
    pub fn new(engine: Arc<BuildEngine>) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                engine,
                jobs: Arc::new(DashMap::new()),
                start_lock: Mutex::new(()),
            }),
        }
    }

    /// Start a build, replacing any build already running for the project
    pub async fn start(
        &self,
        project_id: &ProjectId,
        request: BuildRequest,
        observer: Arc<dyn BuildObserver>,
    ) -> BuildJob {
        self.spawn(project_id, JobKind::Run(request), observer).await
    }

    /// Resume a persisted build, replacing any build already running for the project
    pub async fn resume(&self, project_id: &ProjectId, observer: Arc<dyn BuildObserver>) -> BuildJob {
        self.spawn(project_id, JobKind::Resume, observer).await
    }

    /// Cancel the running build for `project_id` and wait for it to exit.
    /// Returns false when nothing was running.
    pub async fn cancel(&self, project_id: &ProjectId) -> bool {
        let Some(job) = self.active(project_id) else {
            return false;
        };
        job.cancel.cancel();
        job.wait_finished().await;
        true
    }

    pub fn is_running(&self, project_id: &ProjectId) -> bool {
        self.inner.jobs.contains_key(project_id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.jobs.len()
    }

    /// Cancel every running build and wait for all of them
    pub async fn shutdown(&self) {
        let jobs: Vec<ActiveJob> = self
            .inner
            .jobs
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        tracing::info!("Stopping {} running build(s)", jobs.len());
        for job in &jobs {
            job.cancel.cancel();
        }
        for job in jobs {
            job.wait_finished().await;
        }
    }

    fn active(&self, project_id: &ProjectId) -> Option<ActiveJob> {
        self.inner
            .jobs
            .get(project_id)
            .map(|entry| entry.value().clone())
    }

    async fn spawn(
        &self,
        project_id: &ProjectId,
        kind: JobKind,
        observer: Arc<dyn BuildObserver>,
    ) -> BuildJob {
        let _guard = self.inner.start_lock.lock().await;

        if let Some(previous) = self.active(project_id) {
            tracing::info!(
                "Cancelling running build {} for {} before starting a new one",
                previous.id,
                project_id
            );
            previous.cancel.cancel();
            previous.wait_finished().await;
        }

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        // Register before spawning so a fast job cannot finish unregistered
        self.inner.jobs.insert(
            project_id.clone(),
            ActiveJob {
                id,
                cancel: cancel.clone(),
                finished: done_rx,
            },
        );

        let engine = self.inner.engine.clone();
        let jobs = self.inner.jobs.clone();
        let task_project = project_id.clone();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let result = match kind {
                JobKind::Run(request) => {
                    engine
                        .run(&task_project, request, observer.as_ref(), &token)
                        .await
                }
                JobKind::Resume => engine.resume(&task_project, observer.as_ref(), &token).await,
            };

            match &result {
                Ok(outcome) => {
                    tracing::info!("Build {} for {} ended: {}", id, task_project, outcome.label())
                }
                Err(e) => tracing::error!("Build {} for {} errored: {:#}", id, task_project, e),
            }

            jobs.remove_if(&task_project, |_, job| job.id == id);
            let _ = done_tx.send(true);
            result
        });

        tracing::info!("Started build {} for {}", id, project_id);
        BuildJob {
            id,
            project_id: project_id.clone(),
            cancel,
            handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalSqlExecutor;
    use crate::build::{BuildSettings, NoopObserver};
    use crate::oracle::{CallEnvelope, OracleTask, ScriptedOracle};
    use crate::project::Project;
    use crate::store::{InMemoryProjectStore, ProjectStore};
    use std::time::Duration;

    const CODE: &str = r#"{"html":"<p>x</p>","script":"x()","explanation":"done"}"#;

    fn slow_oracle() -> ScriptedOracle {
        ScriptedOracle::new()
            .with_latency(Duration::from_millis(50))
            .respond_with(OracleTask::Classify, |_| Ok("ARCHITECT".into()))
            .respond_with(OracleTask::DetectBackend, |_| Ok(r#"{"requiresDatabase":false}"#.into()))
            .respond_with(OracleTask::Plan, |_| Ok(r#"["Step one","Step two","Step three"]"#.into()))
            .respond_with(OracleTask::CodeStep, |_| Ok(CODE.into()))
    }

    async fn supervisor() -> (BuildSupervisor, Arc<InMemoryProjectStore>, Project) {
        let store = Arc::new(InMemoryProjectStore::new());
        let project = Project::new("eve", "demo");
        store.save(&project).await.unwrap();
        let settings = BuildSettings {
            envelope: CallEnvelope::new(0, Duration::from_millis(1), Duration::from_secs(5)),
            ..Default::default()
        };
        let engine = BuildEngine::new(
            Arc::new(slow_oracle()),
            store.clone(),
            Arc::new(LocalSqlExecutor::new()),
            settings,
        );
        (BuildSupervisor::new(Arc::new(engine)), store, project)
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_runs_to_success_and_unregisters() {
        let (supervisor, _, project) = supervisor().await;
        let job = supervisor
            .start(&project.id, BuildRequest::new("make it"), Arc::new(NoopObserver))
            .await;
        assert!(supervisor.is_running(&project.id));

        let outcome = job.wait().await.unwrap();
        assert_eq!(outcome.label(), "success");
        assert!(!supervisor.is_running(&project.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_cancels_first() {
        let (supervisor, store, project) = supervisor().await;
        let first = supervisor
            .start(&project.id, BuildRequest::new("first"), Arc::new(NoopObserver))
            .await;
        tokio::time::sleep(Duration::from_millis(120)).await;

        let second = supervisor
            .start(&project.id, BuildRequest::new("second"), Arc::new(NoopObserver))
            .await;
        assert_eq!(first.wait().await.unwrap(), BuildOutcome::Cancelled);
        assert_eq!(supervisor.active_count(), 1);

        assert_eq!(second.wait().await.unwrap().label(), "success");
        let saved = store.load(&project.id).await.unwrap().unwrap();
        assert_eq!(saved.last_user_message().unwrap().content, "second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_by_project_id() {
        let (supervisor, _, project) = supervisor().await;
        let job = supervisor
            .start(&project.id, BuildRequest::new("go"), Arc::new(NoopObserver))
            .await;
        job.detach();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(supervisor.cancel(&project.id).await);
        assert!(!supervisor.is_running(&project.id));
        assert!(!supervisor.cancel(&project.id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_cancel_yields_cancelled_outcome() {
        let (supervisor, _, project) = supervisor().await;
        let job = supervisor
            .start(&project.id, BuildRequest::new("go"), Arc::new(NoopObserver))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        job.cancel();
        assert_eq!(job.wait().await.unwrap(), BuildOutcome::Cancelled);
    }
}
