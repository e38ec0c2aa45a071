// Step executor — runs one plan step against the oracle and applies the result
//
// Code steps get a fixed number of attempts with a repair call between them.
// SQL steps never fail the build: any failure degrades the step to a warning.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::checkpoint::Checkpointer;
use super::events::BuildObserver;
use super::prompts::{self, CodePatch, SqlPatch, StepContext};
use super::repair::{RepairOutcome, SelfHealer};
use super::BuildRequest;
use crate::backend::SqlExecutor;
use crate::oracle::{CallEnvelope, EnvelopeError, Oracle};
use crate::planning::{PlanStep, StepKind};
use crate::project::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Completed,
    /// SQL step skipped; the build continues
    Degraded(String),
    /// Code step out of attempts; the artifact is back to its pre-step value
    Exhausted(String),
    Cancelled,
}

pub struct StepExecutor {
    oracle: Arc<dyn Oracle>,
    envelope: CallEnvelope,
    sql: Arc<dyn SqlExecutor>,
    healer: SelfHealer,
    max_code_attempts: u32,
}

impl StepExecutor {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        envelope: CallEnvelope,
        sql: Arc<dyn SqlExecutor>,
        max_code_attempts: u32,
    ) -> Self {
        Self {
            healer: SelfHealer::new(oracle.clone(), envelope),
            oracle,
            envelope,
            sql,
            max_code_attempts: max_code_attempts.max(1),
        }
    }

    pub async fn run_step(
        &self,
        checkpoint: &mut Checkpointer<'_>,
        plan: &[PlanStep],
        index: usize,
        anchor: &BuildRequest,
        observer: &dyn BuildObserver,
        cancel: &CancellationToken,
    ) -> anyhow::Result<StepResult> {
        match plan[index].kind {
            StepKind::Code => {
                self.run_code_step(checkpoint, plan, index, anchor, observer, cancel)
                    .await
            }
            StepKind::Sql => self.run_sql_step(checkpoint, plan, index, anchor, cancel).await,
        }
    }

    async fn run_code_step(
        &self,
        checkpoint: &mut Checkpointer<'_>,
        plan: &[PlanStep],
        index: usize,
        anchor: &BuildRequest,
        observer: &dyn BuildObserver,
        cancel: &CancellationToken,
    ) -> anyhow::Result<StepResult> {
        // A baseline left by an interrupted attempt at this step wins over
        // whatever repairs committed before the interruption
        let snapshot = checkpoint
            .build_state()
            .and_then(|state| state.step_baseline.clone())
            .unwrap_or_else(|| checkpoint.project().artifact.clone());
        checkpoint.project_mut().artifact = snapshot.clone();
        if let Some(state) = checkpoint.build_state_mut() {
            state.step_baseline = Some(snapshot.clone());
        }
        let mut remaining = self.max_code_attempts;

        loop {
            if cancel.is_cancelled() {
                return Ok(StepResult::Cancelled);
            }

            let request = {
                let project = checkpoint.project();
                prompts::code_step_request(&StepContext {
                    request: &anchor.prompt,
                    plan,
                    index,
                    artifact: &project.artifact,
                    backend: project.backend.as_ref().and_then(|b| b.credentials()),
                    images: &anchor.images,
                })
            };

            let error = match self
                .envelope
                .generate(self.oracle.as_ref(), &request, cancel)
                .await
            {
                Err(EnvelopeError::Cancelled) => return Ok(StepResult::Cancelled),
                Err(e) => e.to_string(),
                Ok(response) => {
                    if cancel.is_cancelled() {
                        return Ok(StepResult::Cancelled);
                    }
                    match response.json::<CodePatch>() {
                        Ok(patch) => {
                            patch.apply_to(&mut checkpoint.project_mut().artifact);
                            checkpoint.commit().await?;
                            observer.on_artifact_updated(&checkpoint.project().artifact);
                            return Ok(StepResult::Completed);
                        }
                        Err(e) => format!("malformed code response: {e}"),
                    }
                }
            };

            remaining -= 1;
            tracing::warn!(
                "Step {} attempt failed ({} left): {}",
                index + 1,
                remaining,
                error
            );

            if remaining == 0 {
                // Drop anything repairs wrote between attempts
                checkpoint.project_mut().artifact = snapshot;
                if let Some(state) = checkpoint.build_state_mut() {
                    state.step_baseline = None;
                }
                return Ok(StepResult::Exhausted(error));
            }

            observer.on_recoverable_error(index, &error, remaining);

            if self
                .healer
                .repair(checkpoint, &error, observer, cancel)
                .await?
                == RepairOutcome::Cancelled
            {
                return Ok(StepResult::Cancelled);
            }
        }
    }

    async fn run_sql_step(
        &self,
        checkpoint: &mut Checkpointer<'_>,
        plan: &[PlanStep],
        index: usize,
        anchor: &BuildRequest,
        cancel: &CancellationToken,
    ) -> anyhow::Result<StepResult> {
        // The connection may have dropped since the plan was gated
        checkpoint.refresh_backend().await?;
        if cancel.is_cancelled() {
            return Ok(StepResult::Cancelled);
        }

        let Some(connection) = checkpoint
            .project()
            .backend
            .clone()
            .filter(|backend| backend.is_active())
        else {
            return Ok(degrade(checkpoint, &plan[index], "no active database backend".into()));
        };

        let request = {
            let project = checkpoint.project();
            prompts::sql_step_request(&StepContext {
                request: &anchor.prompt,
                plan,
                index,
                artifact: &project.artifact,
                backend: connection.credentials(),
                images: &[],
            })
        };

        let response = match self
            .envelope
            .generate(self.oracle.as_ref(), &request, cancel)
            .await
        {
            Ok(response) => response,
            Err(EnvelopeError::Cancelled) => return Ok(StepResult::Cancelled),
            Err(e) => {
                return Ok(degrade(checkpoint, &plan[index], format!("SQL generation failed: {e}")))
            }
        };
        if cancel.is_cancelled() {
            return Ok(StepResult::Cancelled);
        }

        let patch: SqlPatch = match response.json() {
            Ok(patch) => patch,
            Err(e) => {
                return Ok(degrade(checkpoint, &plan[index], format!("malformed SQL response: {e}")))
            }
        };
        if patch.sql.trim().is_empty() {
            return Ok(degrade(checkpoint, &plan[index], "empty SQL".into()));
        }

        if let Err(e) = self.sql.execute(&connection, &patch.sql).await {
            return Ok(degrade(checkpoint, &plan[index], format!("{e:#}")));
        }
        if cancel.is_cancelled() {
            return Ok(StepResult::Cancelled);
        }

        tracing::info!("Applied SQL for step {}", index + 1);
        let note = if patch.explanation.trim().is_empty() {
            format!("Database updated: {}", plan[index].description)
        } else {
            format!("Database updated: {}", patch.explanation.trim())
        };
        checkpoint.push_message(Message::system(note));
        Ok(StepResult::Completed)
    }
}

fn degrade(checkpoint: &mut Checkpointer<'_>, step: &PlanStep, error: String) -> StepResult {
    tracing::warn!("Database step \"{}\" skipped: {}", step.description, error);
    checkpoint.push_message(Message::system(format!(
        "Warning: database step \"{}\" could not be applied ({}). Continuing with the remaining steps.",
        step.description, error
    )));
    StepResult::Degraded(error)
}
