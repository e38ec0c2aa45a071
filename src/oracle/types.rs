// Oracle request/response types and JSON extraction helpers

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::project::ImageAttachment;

/// What a call is for. Adapters only log it; test doubles script by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleTask {
    Classify,
    DetectBackend,
    Chat,
    Plan,
    CodeStep,
    SqlStep,
    Repair,
}

impl OracleTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            OracleTask::Classify => "classify",
            OracleTask::DetectBackend => "detect_backend",
            OracleTask::Chat => "chat",
            OracleTask::Plan => "plan",
            OracleTask::CodeStep => "code_step",
            OracleTask::SqlStep => "sql_step",
            OracleTask::Repair => "repair",
        }
    }
}

/// A single generation request
#[derive(Debug, Clone, Serialize)]
pub struct OracleRequest {
    pub task: OracleTask,
    pub prompt: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageAttachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    /// Response schema; `Some` selects constrained JSON output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl OracleRequest {
    pub fn new(task: OracleTask, prompt: impl Into<String>) -> Self {
        Self {
            task,
            prompt: prompt.into(),
            images: Vec::new(),
            system_instruction: None,
            schema: None,
            temperature: None,
        }
    }

    pub fn with_system(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_images(mut self, images: Vec<ImageAttachment>) -> Self {
        self.images = images;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleResponse {
    pub text: String,
}

impl OracleResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Decode the response body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        parse_json(&self.text)
    }
}

/// Parse a JSON value out of oracle text.
///
/// Constrained mode returns bare JSON, but free-text fallbacks may wrap it in
/// markdown fences or surround it with prose.
pub fn parse_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    let stripped = strip_markdown_fences(text.trim());

    if let Ok(value) = serde_json::from_str::<T>(stripped) {
        return Ok(value);
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (stripped.find(open), stripped.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str::<T>(&stripped[start..=end]) {
                    return Ok(value);
                }
            }
        }
    }

    serde_json::from_str::<T>(stripped).context("Oracle returned malformed JSON")
}

/// Strip leading/trailing markdown code fences (```json ... ``` or ``` ... ```)
pub fn strip_markdown_fences(s: &str) -> &str {
    let s = s.trim();
    let s = if let Some(rest) = s.strip_prefix("```json") {
        rest
    } else if let Some(rest) = s.strip_prefix("```") {
        rest
    } else {
        s
    };
    if let Some(rest) = s.strip_suffix("```") {
        rest.trim()
    } else {
        s.trim()
    }
}
