// Build engine — runs one user instruction from routing to a terminal outcome
//
// Flow: route -> compile plan -> gate -> execute steps in order -> success.
// The project is checkpointed after every transition, so a reload at any point
// sees the last committed state and `resume` can continue from it.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::checkpoint::Checkpointer;
use super::events::{BuildFailure, BuildObserver};
use super::executor::{StepExecutor, StepResult};
use crate::backend::SqlExecutor;
use crate::config::Config;
use crate::oracle::{CallEnvelope, EnvelopeError, Oracle};
use crate::planning::{gate, PlanCompiler, PlanError, PlanInput, PlanStep};
use crate::project::{
    BuildState, CodeArtifact, ImageAttachment, Message, ProjectId, ProjectStatus,
};
use crate::router::{IntentRouter, RouteDecision};
use crate::store::ProjectStore;

/// A user instruction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildRequest {
    pub prompt: String,
    pub images: Vec<ImageAttachment>,
}

impl BuildRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            images: Vec::new(),
        }
    }

    pub fn with_images(mut self, images: Vec<ImageAttachment>) -> Self {
        self.images = images;
        self
    }
}

/// How a build ended
#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    /// Conversational message; no build ran
    Chat { reply: String },
    Success { artifact: CodeArtifact },
    /// Halted before publishing the plan; redirect to provisioning
    BackendRequired { sql_steps: Vec<String> },
    Failed {
        index: usize,
        step: String,
        error: String,
    },
    /// Stopped cooperatively; the last checkpoint stands
    Cancelled,
}

impl BuildOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            BuildOutcome::Chat { .. } => "chat",
            BuildOutcome::Success { .. } => "success",
            BuildOutcome::BackendRequired { .. } => "backend_required",
            BuildOutcome::Failed { .. } => "failed",
            BuildOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub envelope: CallEnvelope,
    pub max_code_attempts: u32,
    pub history_window: usize,
    pub assume_backend_when_ambiguous: bool,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            envelope: CallEnvelope::default(),
            max_code_attempts: 3,
            history_window: 5,
            assume_backend_when_ambiguous: true,
        }
    }
}

impl BuildSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            envelope: CallEnvelope::from_config(&config.envelope),
            max_code_attempts: config.build.max_code_attempts,
            history_window: config.build.history_window,
            assume_backend_when_ambiguous: config.build.assume_backend_when_ambiguous,
        }
    }
}

pub struct BuildEngine {
    store: Arc<dyn ProjectStore>,
    router: IntentRouter,
    compiler: PlanCompiler,
    executor: StepExecutor,
    history_window: usize,
}

impl BuildEngine {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        store: Arc<dyn ProjectStore>,
        sql: Arc<dyn SqlExecutor>,
        settings: BuildSettings,
    ) -> Self {
        tracing::debug!("Build engine using oracle '{}'", oracle.name());
        Self {
            router: IntentRouter::new(oracle.clone(), settings.envelope)
                .with_backend_default(settings.assume_backend_when_ambiguous),
            compiler: PlanCompiler::new(oracle.clone(), settings.envelope),
            executor: StepExecutor::new(oracle, settings.envelope, sql, settings.max_code_attempts),
            store,
            history_window: settings.history_window,
        }
    }

    pub fn store(&self) -> &Arc<dyn ProjectStore> {
        &self.store
    }

    /// Run a build for `project_id`.
    ///
    /// Terminal conditions come back as `BuildOutcome`; `Err` means the store
    /// failed, the project does not exist, or a chat reply could not be produced.
    pub async fn run(
        &self,
        project_id: &ProjectId,
        request: BuildRequest,
        observer: &dyn BuildObserver,
        cancel: &CancellationToken,
    ) -> Result<BuildOutcome> {
        let mut checkpoint = Checkpointer::load(self.store.as_ref(), project_id).await?;
        if cancel.is_cancelled() {
            return Ok(BuildOutcome::Cancelled);
        }

        checkpoint.push_message(Message::user(&request.prompt, request.images.clone()));
        checkpoint.commit().await?;

        let history = checkpoint
            .project()
            .trailing_history(self.history_window)
            .to_vec();

        let wants_backend = match self.router.route(&request.prompt, &history, cancel).await {
            Ok(RouteDecision::Chat { reply }) => {
                checkpoint.push_message(Message::assistant(&reply));
                checkpoint.commit().await?;
                return Ok(BuildOutcome::Chat { reply });
            }
            Ok(RouteDecision::Architect { needs_backend }) => needs_backend,
            Err(EnvelopeError::Cancelled) => {
                tracing::info!("Build for {} cancelled during routing", project_id);
                return Ok(BuildOutcome::Cancelled);
            }
            Err(e) => return Err(e).context("Failed to answer chat message"),
        };

        if cancel.is_cancelled() {
            return Ok(BuildOutcome::Cancelled);
        }

        let input = PlanInput {
            request: &request.prompt,
            images: &request.images,
            history: &history,
            backend_active: checkpoint.project().backend_active(),
            wants_backend,
        };
        let plan = match self.compiler.compile(input, cancel).await {
            Ok(plan) => plan,
            Err(PlanError::Cancelled) => {
                tracing::info!("Build for {} cancelled during planning", project_id);
                return Ok(BuildOutcome::Cancelled);
            }
            Err(PlanError::BackendRequired { plan }) => {
                return self.halt_for_backend(checkpoint, &plan, observer).await;
            }
        };

        if cancel.is_cancelled() {
            return Ok(BuildOutcome::Cancelled);
        }

        {
            let project = checkpoint.project_mut();
            project.build_state = Some(BuildState::new(plan.clone()));
            project.status = ProjectStatus::Generating;
        }
        checkpoint.push_message(Message::assistant(render_plan_message(&plan)));
        checkpoint.commit().await?;
        tracing::info!("Published plan for {} ({} steps)", project_id, plan.len());
        observer.on_plan_published(&plan);

        self.execute_plan(checkpoint, &request, observer, cancel).await
    }

    /// Continue a persisted build from the step after `lastCompletedStep`.
    ///
    /// The most recent user message is the request the steps are built against.
    pub async fn resume(
        &self,
        project_id: &ProjectId,
        observer: &dyn BuildObserver,
        cancel: &CancellationToken,
    ) -> Result<BuildOutcome> {
        let mut checkpoint = Checkpointer::load(self.store.as_ref(), project_id).await?;
        let Some(state) = checkpoint.build_state() else {
            bail!("Project {project_id} has no build to resume");
        };
        let start = state.resume_index();

        let anchor = checkpoint
            .project()
            .last_user_message()
            .map(|m| BuildRequest {
                prompt: m.content.clone(),
                images: m.images.clone(),
            })
            .with_context(|| format!("Project {project_id} has no user message to resume from"))?;

        if cancel.is_cancelled() {
            return Ok(BuildOutcome::Cancelled);
        }

        tracing::info!("Resuming build for {} at step {}", project_id, start + 1);
        {
            let project = checkpoint.project_mut();
            project.status = ProjectStatus::Generating;
            if let Some(state) = project.build_state.as_mut() {
                state.error = None;
            }
        }
        checkpoint.commit().await?;

        self.execute_plan(checkpoint, &anchor, observer, cancel).await
    }

    async fn execute_plan(
        &self,
        mut checkpoint: Checkpointer<'_>,
        anchor: &BuildRequest,
        observer: &dyn BuildObserver,
        cancel: &CancellationToken,
    ) -> Result<BuildOutcome> {
        let (plan, start) = match checkpoint.build_state() {
            Some(state) => (state.plan.clone(), state.resume_index()),
            None => bail!("Project {} has no build state", checkpoint.project().id),
        };

        for (index, step) in plan.iter().enumerate().skip(start) {
            if cancel.is_cancelled() {
                tracing::info!("Build cancelled before step {}", index + 1);
                return Ok(BuildOutcome::Cancelled);
            }

            if let Some(state) = checkpoint.build_state_mut() {
                state.current_step = index;
                state.error = None;
            }
            checkpoint.commit().await?;
            observer.on_step_started(index, step);
            tracing::info!(
                "Step {}/{} [{}]: {}",
                index + 1,
                plan.len(),
                step.kind.as_str(),
                step.description
            );

            match self
                .executor
                .run_step(&mut checkpoint, &plan, index, anchor, observer, cancel)
                .await?
            {
                StepResult::Completed => {}
                StepResult::Degraded(error) => observer.on_step_degraded(index, &error),
                StepResult::Cancelled => {
                    tracing::info!("Build cancelled during step {}", index + 1);
                    return Ok(BuildOutcome::Cancelled);
                }
                StepResult::Exhausted(error) => {
                    return self.fail_build(checkpoint, index, step, error, observer).await;
                }
            }

            if let Some(state) = checkpoint.build_state_mut() {
                state.mark_completed(index);
            }
            checkpoint.commit().await?;
            observer.on_step_completed(index);
        }

        let artifact = {
            let project = checkpoint.project_mut();
            project.build_state = None;
            project.status = ProjectStatus::Idle;
            project.artifact.clone()
        };
        let summary = if artifact.explanation.trim().is_empty() {
            "Build complete.".to_string()
        } else {
            artifact.explanation.trim().to_string()
        };
        checkpoint.push_message(Message::assistant(summary));
        checkpoint.commit().await?;
        tracing::info!("Build for {} succeeded", checkpoint.project().id);
        observer.on_success(&artifact);

        Ok(BuildOutcome::Success { artifact })
    }

    async fn fail_build(
        &self,
        mut checkpoint: Checkpointer<'_>,
        index: usize,
        step: &PlanStep,
        error: String,
        observer: &dyn BuildObserver,
    ) -> Result<BuildOutcome> {
        let failure = BuildFailure::StepExhausted {
            index,
            step: step.description.clone(),
            error: error.clone(),
        };
        let description = failure.describe();

        // The unfinished build stays attached, so the project stays generating
        // until it is resumed or replaced
        {
            let project = checkpoint.project_mut();
            project.status = ProjectStatus::Generating;
            if let Some(state) = project.build_state.as_mut() {
                state.current_step = index;
                state.error = Some(description.clone());
            }
        }
        checkpoint.push_message(Message::system(format!("Build failed: {description}")));
        checkpoint.commit().await?;
        tracing::error!("Build for {} failed: {}", checkpoint.project().id, description);
        observer.on_final_error(&failure);

        Ok(BuildOutcome::Failed {
            index,
            step: step.description.clone(),
            error,
        })
    }

    async fn halt_for_backend(
        &self,
        mut checkpoint: Checkpointer<'_>,
        plan: &[PlanStep],
        observer: &dyn BuildObserver,
    ) -> Result<BuildOutcome> {
        let sql_steps: Vec<String> = plan
            .iter()
            .filter(|step| step.is_sql())
            .map(|step| step.description.clone())
            .collect();

        {
            let project = checkpoint.project_mut();
            project.build_state = None;
            project.status = ProjectStatus::Idle;
        }
        checkpoint.push_message(Message::system(gate::provisioning_redirect_message()));
        checkpoint.commit().await?;
        tracing::info!(
            "Build for {} halted: database backend required",
            checkpoint.project().id
        );

        observer.on_final_error(&BuildFailure::BackendRequired {
            sql_steps: sql_steps.clone(),
        });
        Ok(BuildOutcome::BackendRequired { sql_steps })
    }
}

fn render_plan_message(plan: &[PlanStep]) -> String {
    let steps = plan
        .iter()
        .enumerate()
        .map(|(i, step)| format!("{}. {}", i + 1, step.description))
        .collect::<Vec<_>>()
        .join("\n");
    format!("Here is the plan:\n{steps}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalSqlExecutor;
    use crate::build::NoopObserver;
    use crate::oracle::{OracleTask, ScriptedOracle};
    use crate::project::Project;
    use crate::store::InMemoryProjectStore;
    use std::time::Duration;

    fn engine(oracle: ScriptedOracle) -> (BuildEngine, Arc<InMemoryProjectStore>) {
        let store = Arc::new(InMemoryProjectStore::new());
        let settings = BuildSettings {
            envelope: CallEnvelope::new(0, Duration::from_millis(1), Duration::from_secs(5)),
            ..Default::default()
        };
        let engine = BuildEngine::new(
            Arc::new(oracle),
            store.clone(),
            Arc::new(LocalSqlExecutor::new()),
            settings,
        );
        (engine, store)
    }

    #[test]
    fn test_plan_message_lists_steps() {
        let plan = vec![PlanStep::inferred("Add header"), PlanStep::inferred("Add footer")];
        assert_eq!(
            render_plan_message(&plan),
            "Here is the plan:\n1. Add header\n2. Add footer"
        );
    }

    #[tokio::test]
    async fn test_chat_records_reply_without_build() {
        let (engine, store) = engine(
            ScriptedOracle::new()
                .reply(OracleTask::Classify, "CHAT")
                .reply(OracleTask::Chat, "Hi! Describe your app."),
        );
        let project = Project::new("eve", "demo");
        store.save(&project).await.unwrap();

        let outcome = engine
            .run(&project.id, BuildRequest::new("hello"), &NoopObserver, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.label(), "chat");
        let saved = store.load(&project.id).await.unwrap().unwrap();
        assert_eq!(saved.messages.len(), 2);
        assert!(saved.build_state.is_none());
        assert_eq!(saved.status, ProjectStatus::Idle);
    }

    #[tokio::test]
    async fn test_missing_project_is_an_error() {
        let (engine, _) = engine(ScriptedOracle::new());
        let result = engine
            .run(&"ghost".to_string(), BuildRequest::new("x"), &NoopObserver, &CancellationToken::new())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_resume_without_build_state_errors() {
        let (engine, store) = engine(ScriptedOracle::new());
        let project = Project::new("eve", "demo");
        store.save(&project).await.unwrap();
        let err = engine
            .resume(&project.id, &NoopObserver, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no build to resume"));
    }
}
