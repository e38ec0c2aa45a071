// Build observer callbacks and the event stream adapter

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::planning::PlanStep;
use crate::project::CodeArtifact;

/// Why a build ended without success
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildFailure {
    /// The plan needs a database and the project has none. Callers redirect to
    /// provisioning instead of showing a failure.
    BackendRequired { sql_steps: Vec<String> },
    /// A code step used up its attempts
    StepExhausted {
        index: usize,
        step: String,
        error: String,
    },
}

impl BuildFailure {
    pub fn is_backend_required(&self) -> bool {
        matches!(self, BuildFailure::BackendRequired { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            BuildFailure::BackendRequired { sql_steps } => format!(
                "a database backend is required ({} database step(s))",
                sql_steps.len()
            ),
            BuildFailure::StepExhausted { index, step, error } => {
                format!("step {} \"{}\" failed: {}", index + 1, step, error)
            }
        }
    }
}

/// Callbacks fired by a running build. Every method defaults to a no-op.
///
/// Callbacks run inline on the build task and must not block.
pub trait BuildObserver: Send + Sync {
    fn on_plan_published(&self, _plan: &[PlanStep]) {}

    fn on_step_started(&self, _index: usize, _step: &PlanStep) {}

    fn on_step_completed(&self, _index: usize) {}

    fn on_artifact_updated(&self, _artifact: &CodeArtifact) {}

    /// A database step failed and was skipped
    fn on_step_degraded(&self, _index: usize, _error: &str) {}

    /// A code step attempt failed; `remaining` attempts are left
    fn on_recoverable_error(&self, _index: usize, _error: &str, _remaining: u32) {}

    fn on_success(&self, _artifact: &CodeArtifact) {}

    fn on_final_error(&self, _failure: &BuildFailure) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl BuildObserver for NoopObserver {}

/// Owned form of the observer callbacks, for channel consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BuildEvent {
    PlanPublished { plan: Vec<PlanStep> },
    StepStarted { index: usize, description: String },
    StepCompleted { index: usize },
    ArtifactUpdated { artifact: CodeArtifact },
    StepDegraded { index: usize, error: String },
    RecoverableError {
        index: usize,
        error: String,
        remaining: u32,
    },
    Success { artifact: CodeArtifact },
    FinalError { failure: BuildFailure },
}

impl BuildEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildEvent::Success { .. } | BuildEvent::FinalError { .. })
    }
}

// A closed receiver just means nobody is listening any more.
impl BuildObserver for UnboundedSender<BuildEvent> {
    fn on_plan_published(&self, plan: &[PlanStep]) {
        let _ = self.send(BuildEvent::PlanPublished {
            plan: plan.to_vec(),
        });
    }

    fn on_step_started(&self, index: usize, step: &PlanStep) {
        let _ = self.send(BuildEvent::StepStarted {
            index,
            description: step.description.clone(),
        });
    }

    fn on_step_completed(&self, index: usize) {
        let _ = self.send(BuildEvent::StepCompleted { index });
    }

    fn on_artifact_updated(&self, artifact: &CodeArtifact) {
        let _ = self.send(BuildEvent::ArtifactUpdated {
            artifact: artifact.clone(),
        });
    }

    fn on_step_degraded(&self, index: usize, error: &str) {
        let _ = self.send(BuildEvent::StepDegraded {
            index,
            error: error.to_string(),
        });
    }

    fn on_recoverable_error(&self, index: usize, error: &str, remaining: u32) {
        let _ = self.send(BuildEvent::RecoverableError {
            index,
            error: error.to_string(),
            remaining,
        });
    }

    fn on_success(&self, artifact: &CodeArtifact) {
        let _ = self.send(BuildEvent::Success {
            artifact: artifact.clone(),
        });
    }

    fn on_final_error(&self, failure: &BuildFailure) {
        let _ = self.send(BuildEvent::FinalError {
            failure: failure.clone(),
        });
    }
}
