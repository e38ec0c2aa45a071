// Project record types — the shared mutable resource a build job owns

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::planning::PlanStep;

/// Stable project identifier
pub type ProjectId = String;

/// Who wrote a message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// Image attached to a user message (base64 payload, sent inline to the oracle)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageAttachment {
    pub mime_type: String,
    pub data: String,
}

/// One entry in the append-only conversation log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageAttachment>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            images: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>, images: Vec<ImageAttachment>) -> Self {
        Self {
            images,
            ..Self::new(Role::User, content)
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// The generated application code. Every field may be empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodeArtifact {
    #[serde(default)]
    pub html: String,
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub stylesheet: String,
    #[serde(default)]
    pub explanation: String,
}

impl CodeArtifact {
    pub fn is_empty(&self) -> bool {
        self.html.is_empty() && self.script.is_empty() && self.stylesheet.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    #[default]
    Idle,
    Generating,
}

/// Checkpointed progress of a multi-step build
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildState {
    pub plan: Vec<PlanStep>,
    pub current_step: usize,
    /// Highest fully applied step index; -1 before any step completes
    pub last_completed_step: i64,
    pub error: Option<String>,
    /// Artifact as it was before the in-flight code step started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_baseline: Option<CodeArtifact>,
}

impl BuildState {
    pub fn new(plan: Vec<PlanStep>) -> Self {
        Self {
            plan,
            current_step: 0,
            last_completed_step: -1,
            error: None,
            step_baseline: None,
        }
    }

    /// Index of the first step that has not been applied yet
    pub fn resume_index(&self) -> usize {
        (self.last_completed_step + 1).max(0) as usize
    }

    pub fn is_finished(&self) -> bool {
        self.resume_index() >= self.plan.len()
    }

    /// Record `index` as applied. Never moves backwards and never passes the plan end.
    pub fn mark_completed(&mut self, index: usize) {
        let last = self.plan.len() as i64 - 1;
        let candidate = (index as i64).min(last);
        if candidate > self.last_completed_step {
            self.last_completed_step = candidate;
        }
        self.step_baseline = None;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningStatus {
    Creating,
    Active,
    Failed,
}

/// Backend created through the provisioning service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedBackend {
    pub reference: String,
    pub status: ProvisioningStatus,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Backend connection attached to a project
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConnection {
    Managed(ManagedBackend),
    Manual { url: String, api_key: String },
}

/// Credentials generated code needs to reach the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCredentials<'a> {
    pub url: &'a str,
    pub api_key: &'a str,
}

impl BackendConnection {
    pub fn is_active(&self) -> bool {
        self.credentials().is_some()
    }

    pub fn credentials(&self) -> Option<BackendCredentials<'_>> {
        match self {
            BackendConnection::Managed(managed) => {
                if managed.status != ProvisioningStatus::Active {
                    return None;
                }
                match (managed.url.as_deref(), managed.api_key.as_deref()) {
                    (Some(url), Some(api_key)) if !url.is_empty() => {
                        Some(BackendCredentials { url, api_key })
                    }
                    _ => None,
                }
            }
            BackendConnection::Manual { url, api_key } => {
                if url.trim().is_empty() || api_key.trim().is_empty() {
                    None
                } else {
                    Some(BackendCredentials { url, api_key })
                }
            }
        }
    }
}

/// A user's application under construction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: ProjectId,
    pub owner: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub artifact: CodeArtifact,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub status: ProjectStatus,
    #[serde(default)]
    pub build_state: Option<BuildState>,
    #[serde(default)]
    pub backend: Option<BackendConnection>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner: owner.into(),
            name: name.into(),
            artifact: CodeArtifact::default(),
            messages: Vec::new(),
            status: ProjectStatus::Idle,
            build_state: None,
            backend: None,
            updated_at: Utc::now(),
        }
    }

    pub fn backend_active(&self) -> bool {
        self.backend.as_ref().is_some_and(BackendConnection::is_active)
    }

    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// The most recent user message, used as the request anchor when resuming
    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }

    /// The last `window` messages before the most recent one
    pub fn trailing_history(&self, window: usize) -> &[Message] {
        let end = self.messages.len().saturating_sub(1);
        let start = end.saturating_sub(window);
        &self.messages[start..end]
    }
}
