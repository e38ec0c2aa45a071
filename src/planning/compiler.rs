// Plan compiler — turns a request into an ordered list of typed steps

use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::gate::{self, GateDecision};
use super::types::{fallback_plan, PlanStep, StepKind};
use crate::oracle::{CallEnvelope, EnvelopeError, Oracle, OracleRequest, OracleTask};
use crate::project::{ImageAttachment, Message};

const PLAN_TEMPERATURE: f32 = 0.2;

const PLAN_SYSTEM_INSTRUCTION: &str = "You are the lead architect of a single-page web app \
builder. Break the user's request into an ordered plan of 4 to 8 short imperative steps. \
Each step is an object {\"description\": string, \"kind\": \"code\" | \"sql\"}. Use kind \
\"sql\" only for steps that create or change database tables, indexes or data; every other \
step is \"code\". Return only the JSON array.";

/// Why compilation did not produce a publishable plan
#[derive(Debug, Error)]
pub enum PlanError {
    /// Sentinel: the plan needs a backend the project does not have.
    /// Raised before the plan is published anywhere.
    #[error("plan requires a database backend")]
    BackendRequired { plan: Vec<PlanStep> },
    #[error("plan compilation cancelled")]
    Cancelled,
}

/// Everything the compiler looks at
#[derive(Debug, Clone, Copy)]
pub struct PlanInput<'a> {
    pub request: &'a str,
    pub images: &'a [ImageAttachment],
    pub history: &'a [Message],
    pub backend_active: bool,
    /// Router's opinion that the request needs persistent storage
    pub wants_backend: bool,
}

pub struct PlanCompiler {
    oracle: Arc<dyn Oracle>,
    envelope: CallEnvelope,
}

impl PlanCompiler {
    pub fn new(oracle: Arc<dyn Oracle>, envelope: CallEnvelope) -> Self {
        Self { oracle, envelope }
    }

    /// Compile and gate a plan.
    ///
    /// Never fails on oracle trouble: unreadable output or an exhausted
    /// envelope yields the generic fallback plan.
    pub async fn compile(
        &self,
        input: PlanInput<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PlanStep>, PlanError> {
        let request = OracleRequest::new(OracleTask::Plan, build_plan_prompt(&input))
            .with_system(PLAN_SYSTEM_INSTRUCTION)
            .with_schema(plan_schema())
            .with_temperature(PLAN_TEMPERATURE)
            .with_images(input.images.to_vec());

        let plan = match self
            .envelope
            .generate(self.oracle.as_ref(), &request, cancel)
            .await
        {
            Ok(response) => parse_plan(&response.text).unwrap_or_else(|| {
                tracing::warn!("Plan response was not a readable step list; using fallback plan");
                fallback_plan()
            }),
            Err(EnvelopeError::Cancelled) => return Err(PlanError::Cancelled),
            Err(e) => {
                tracing::warn!("Plan compilation failed, using fallback plan: {}", e);
                fallback_plan()
            }
        };

        if cancel.is_cancelled() {
            return Err(PlanError::Cancelled);
        }

        match gate::check(&plan, input.backend_active) {
            GateDecision::Proceed => {
                tracing::info!("Compiled plan with {} step(s)", plan.len());
                Ok(plan)
            }
            GateDecision::BackendRequired { sql_steps } => {
                tracing::info!(
                    "Plan needs a backend ({} SQL step(s)) and none is active",
                    sql_steps.len()
                );
                Err(PlanError::BackendRequired { plan })
            }
        }
    }
}

fn plan_schema() -> serde_json::Value {
    json!({
        "type": "ARRAY",
        "items": {
            "type": "OBJECT",
            "properties": {
                "description": {"type": "STRING"},
                "kind": {"type": "STRING", "enum": ["code", "sql"]}
            },
            "required": ["description", "kind"]
        }
    })
}

fn build_plan_prompt(input: &PlanInput<'_>) -> String {
    let mut prompt = String::new();

    if !input.history.is_empty() {
        prompt.push_str("Recent conversation:\n");
        for message in input.history {
            prompt.push_str(&format!("{}: {}\n", message.role.as_str(), message.content));
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!("Request: {}\n\n", input.request));

    if input.backend_active {
        prompt.push_str("A database backend is connected; data can be persisted with SQL steps.\n");
    } else if input.wants_backend {
        prompt.push_str(
            "The request appears to need persistent storage but no database is connected yet.\n",
        );
    } else {
        prompt.push_str("No database is connected; prefer client-side state.\n");
    }

    if !input.images.is_empty() {
        prompt.push_str(&format!(
            "{} reference image(s) are attached; follow their layout and style.\n",
            input.images.len()
        ));
    }

    prompt
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawStep {
    Tagged {
        #[serde(alias = "step")]
        description: String,
        #[serde(default)]
        kind: Option<String>,
    },
    Bare(String),
}

impl RawStep {
    fn into_step(self) -> Option<PlanStep> {
        let (description, kind) = match self {
            RawStep::Tagged { description, kind } => (description, kind),
            RawStep::Bare(description) => (description, None),
        };
        let description = description.trim().to_string();
        if description.is_empty() {
            return None;
        }
        let kind = match kind.as_deref().map(|k| k.trim().to_ascii_lowercase()) {
            Some(k) if k == "sql" => StepKind::Sql,
            Some(k) if k == "code" => StepKind::Code,
            _ => StepKind::infer(&description),
        };
        Some(PlanStep::new(description, kind))
    }
}

/// Parse the oracle's plan; `None` when it is not a non-empty step list
fn parse_plan(text: &str) -> Option<Vec<PlanStep>> {
    let raw: Vec<RawStep> = crate::oracle::parse_json(text).ok()?;
    let steps: Vec<PlanStep> = raw.into_iter().filter_map(RawStep::into_step).collect();
    if steps.is_empty() {
        None
    } else {
        Some(steps)
    }
}
