// Self-healing repair — asks the oracle to fix the script after a failed attempt

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::checkpoint::Checkpointer;
use super::events::BuildObserver;
use super::prompts::{self, ScriptFix};
use crate::oracle::{CallEnvelope, EnvelopeError, Oracle};
use crate::project::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Script replaced and the fix recorded
    Applied,
    /// Repair failed; the artifact is untouched
    Skipped,
    Cancelled,
}

pub struct SelfHealer {
    oracle: Arc<dyn Oracle>,
    envelope: CallEnvelope,
}

impl SelfHealer {
    /// Repairs never retry inside the envelope; the step's attempt counter
    /// bounds the total number of calls.
    pub fn new(oracle: Arc<dyn Oracle>, envelope: CallEnvelope) -> Self {
        Self {
            oracle,
            envelope: envelope.one_shot(),
        }
    }

    /// Try to repair the artifact's script given `error`.
    ///
    /// Failures are logged and swallowed. Only store errors are returned.
    pub async fn repair(
        &self,
        checkpoint: &mut Checkpointer<'_>,
        error: &str,
        observer: &dyn BuildObserver,
        cancel: &CancellationToken,
    ) -> anyhow::Result<RepairOutcome> {
        if cancel.is_cancelled() {
            return Ok(RepairOutcome::Cancelled);
        }

        let request = prompts::repair_request(error, &checkpoint.project().artifact.script);
        let response = match self
            .envelope
            .generate(self.oracle.as_ref(), &request, cancel)
            .await
        {
            Ok(response) => response,
            Err(EnvelopeError::Cancelled) => return Ok(RepairOutcome::Cancelled),
            Err(e) => {
                tracing::warn!("Repair call failed: {}", e);
                return Ok(RepairOutcome::Skipped);
            }
        };

        if cancel.is_cancelled() {
            return Ok(RepairOutcome::Cancelled);
        }

        let fix: ScriptFix = match response.json() {
            Ok(fix) => fix,
            Err(e) => {
                tracing::warn!("Unreadable repair response: {}", e);
                return Ok(RepairOutcome::Skipped);
            }
        };
        if fix.script.trim().is_empty() {
            tracing::warn!("Repair returned an empty script; ignoring");
            return Ok(RepairOutcome::Skipped);
        }

        let explanation = if fix.explanation.trim().is_empty() {
            "script corrected".to_string()
        } else {
            fix.explanation.trim().to_string()
        };
        tracing::info!("Auto-fix applied: {}", explanation);

        checkpoint.project_mut().artifact.script = fix.script;
        checkpoint.push_message(Message::system(format!("(Auto-fix: {explanation})")));
        checkpoint.commit().await?;
        observer.on_artifact_updated(&checkpoint.project().artifact);

        Ok(RepairOutcome::Applied)
    }
}
