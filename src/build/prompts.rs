// Step, SQL and repair prompts plus their response shapes

use serde::Deserialize;
use serde_json::{json, Value};

use crate::oracle::{OracleRequest, OracleTask};
use crate::planning::PlanStep;
use crate::project::{BackendCredentials, CodeArtifact, ImageAttachment};

const CODE_TEMPERATURE: f32 = 0.4;
const SQL_TEMPERATURE: f32 = 0.1;
const REPAIR_TEMPERATURE: f32 = 0.2;

const CODE_SYSTEM_INSTRUCTION: &str = "You are a senior front-end engineer building a \
single-page web app. Apply exactly one plan step to the current code. Always return the \
COMPLETE code for every field you return, never a diff or a fragment. The script runs in a \
browser without a bundler. Return JSON {html, script, stylesheet, explanation}.";

const SQL_SYSTEM_INSTRUCTION: &str = "You are a database engineer. Write SQL for one plan \
step. Statements must be idempotent where possible (IF NOT EXISTS). Return JSON \
{sql, explanation}.";

const REPAIR_SYSTEM_INSTRUCTION: &str = "You fix broken JavaScript. Given an error and the \
current script, return the corrected COMPLETE script and a one-sentence explanation as \
JSON {script, explanation}.";

/// Everything a code or SQL step prompt embeds
pub struct StepContext<'a> {
    pub request: &'a str,
    pub plan: &'a [PlanStep],
    pub index: usize,
    pub artifact: &'a CodeArtifact,
    pub backend: Option<BackendCredentials<'a>>,
    pub images: &'a [ImageAttachment],
}

impl StepContext<'_> {
    fn step(&self) -> &str {
        self.plan
            .get(self.index)
            .map(|s| s.description.as_str())
            .unwrap_or_default()
    }

    fn render_plan(&self) -> String {
        self.plan
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let marker = if i == self.index { "->" } else { "  " };
                format!("{marker} {}. [{}] {}", i + 1, step.kind.as_str(), step.description)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Code step response. `script` is required; absent fields keep their value.
#[derive(Debug, Clone, Deserialize)]
pub struct CodePatch {
    #[serde(default)]
    pub html: Option<String>,
    pub script: String,
    #[serde(default, alias = "css")]
    pub stylesheet: Option<String>,
    #[serde(default)]
    pub explanation: String,
}

impl CodePatch {
    /// Replace every returned field wholesale
    pub fn apply_to(self, artifact: &mut CodeArtifact) {
        if let Some(html) = self.html {
            artifact.html = html;
        }
        artifact.script = self.script;
        if let Some(stylesheet) = self.stylesheet {
            artifact.stylesheet = stylesheet;
        }
        artifact.explanation = self.explanation;
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SqlPatch {
    pub sql: String,
    #[serde(default)]
    pub explanation: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptFix {
    pub script: String,
    #[serde(default)]
    pub explanation: String,
}

pub fn code_step_request(ctx: &StepContext<'_>) -> OracleRequest {
    let mut prompt = format!(
        "User request: {}\n\nPlan:\n{}\n\nCurrent step ({} of {}): {}\n\n",
        ctx.request,
        ctx.render_plan(),
        ctx.index + 1,
        ctx.plan.len(),
        ctx.step()
    );

    if let Some(backend) = &ctx.backend {
        prompt.push_str(&format!(
            "A database backend is available to the generated code.\nURL: {}\nAPI key: {}\n\n",
            backend.url, backend.api_key
        ));
    }

    prompt.push_str(&render_artifact(ctx.artifact));

    OracleRequest::new(OracleTask::CodeStep, prompt)
        .with_system(CODE_SYSTEM_INSTRUCTION)
        .with_schema(code_schema())
        .with_temperature(CODE_TEMPERATURE)
        .with_images(ctx.images.to_vec())
}

pub fn sql_step_request(ctx: &StepContext<'_>) -> OracleRequest {
    let prompt = format!(
        "User request: {}\n\nPlan:\n{}\n\nWrite the SQL for step {}: {}\n",
        ctx.request,
        ctx.render_plan(),
        ctx.index + 1,
        ctx.step()
    );

    OracleRequest::new(OracleTask::SqlStep, prompt)
        .with_system(SQL_SYSTEM_INSTRUCTION)
        .with_schema(json!({
            "type": "OBJECT",
            "properties": {
                "sql": {"type": "STRING"},
                "explanation": {"type": "STRING"}
            },
            "required": ["sql", "explanation"]
        }))
        .with_temperature(SQL_TEMPERATURE)
}

pub fn repair_request(error: &str, script: &str) -> OracleRequest {
    let prompt = format!("Error:\n{error}\n\nCurrent script:\n```javascript\n{script}\n```\n");

    OracleRequest::new(OracleTask::Repair, prompt)
        .with_system(REPAIR_SYSTEM_INSTRUCTION)
        .with_schema(json!({
            "type": "OBJECT",
            "properties": {
                "script": {"type": "STRING"},
                "explanation": {"type": "STRING"}
            },
            "required": ["script", "explanation"]
        }))
        .with_temperature(REPAIR_TEMPERATURE)
}

fn code_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "html": {"type": "STRING"},
            "script": {"type": "STRING"},
            "stylesheet": {"type": "STRING"},
            "explanation": {"type": "STRING"}
        },
        "required": ["script", "explanation"]
    })
}

fn render_artifact(artifact: &CodeArtifact) -> String {
    if artifact.is_empty() {
        return "There is no code yet; start from scratch.\n".to_string();
    }
    format!(
        "Current HTML:\n```html\n{}\n```\n\nCurrent script:\n```javascript\n{}\n```\n\nCurrent stylesheet:\n```css\n{}\n```\n",
        artifact.html, artifact.script, artifact.stylesheet
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planning::StepKind;

    fn plan() -> Vec<PlanStep> {
        vec![
            PlanStep::new("Add contact form", StepKind::Code),
            PlanStep::new("Create submissions table", StepKind::Sql),
        ]
    }

    #[test]
    fn test_code_prompt_embeds_plan_artifact_and_backend() {
        let plan = plan();
        let artifact = CodeArtifact {
            html: "<main></main>".into(),
            script: "console.log(1)".into(),
            ..Default::default()
        };
        let ctx = StepContext {
            request: "contact page",
            plan: &plan,
            index: 0,
            artifact: &artifact,
            backend: Some(BackendCredentials {
                url: "sqlite:///tmp/x.db",
                api_key: "key-1",
            }),
            images: &[],
        };
        let request = code_step_request(&ctx);
        assert_eq!(request.task, OracleTask::CodeStep);
        assert!(request.prompt.contains("-> 1. [code] Add contact form"));
        assert!(request.prompt.contains("   2. [sql] Create submissions table"));
        assert!(request.prompt.contains("console.log(1)"));
        assert!(request.prompt.contains("API key: key-1"));
        assert!(request.schema.is_some());
    }

    #[test]
    fn test_code_prompt_without_artifact_or_backend() {
        let plan = plan();
        let artifact = CodeArtifact::default();
        let ctx = StepContext {
            request: "contact page",
            plan: &plan,
            index: 0,
            artifact: &artifact,
            backend: None,
            images: &[],
        };
        let prompt = code_step_request(&ctx).prompt;
        assert!(prompt.contains("start from scratch"));
        assert!(!prompt.contains("API key"));
    }

    #[test]
    fn test_code_patch_replaces_returned_fields_only() {
        let mut artifact = CodeArtifact {
            html: "<p>old</p>".into(),
            script: "old()".into(),
            stylesheet: "p{}".into(),
            explanation: "old".into(),
        };
        let patch: CodePatch =
            serde_json::from_str(r#"{"script":"new()","css":"h1{}","explanation":"restyled"}"#)
                .unwrap();
        patch.apply_to(&mut artifact);
        assert_eq!(artifact.html, "<p>old</p>");
        assert_eq!(artifact.script, "new()");
        assert_eq!(artifact.stylesheet, "h1{}");
        assert_eq!(artifact.explanation, "restyled");
    }

    #[test]
    fn test_code_patch_requires_script() {
        assert!(serde_json::from_str::<CodePatch>(r#"{"explanation":"nothing"}"#).is_err());
    }

    #[test]
    fn test_repair_prompt_carries_error_and_script() {
        let request = repair_request("ReferenceError: foo is not defined", "foo()");
        assert_eq!(request.task, OracleTask::Repair);
        assert!(request.prompt.contains("ReferenceError"));
        assert!(request.prompt.contains("foo()"));
    }
}
