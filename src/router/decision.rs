// Routing decision logic — code change ("architect") vs conversation ("chat")

use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::oracle::{CallEnvelope, EnvelopeError, Oracle, OracleRequest, OracleTask};
use crate::project::Message;

const CLASSIFY_TEMPERATURE: f32 = 0.0;
const CHAT_TEMPERATURE: f32 = 0.7;

const CLASSIFY_INSTRUCTION: &str = "Classify the user's latest message. Answer ARCHITECT if \
it asks to create, change, fix or restyle the application. Answer CHAT if it is a question \
or conversation that needs no code change. Answer with exactly one token.";

const BACKEND_INSTRUCTION: &str = "Decide whether fulfilling the user's request requires \
persistent server-side storage (saving records, accounts, submissions, shared data). \
Respond with JSON {\"requiresDatabase\": true|false}.";

const CHAT_INSTRUCTION: &str = "You are a friendly assistant inside a web app builder. \
Answer the user's question briefly. Do not write code unless asked.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Architect,
    Chat,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Architect => "architect",
            Intent::Chat => "chat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Conversational reply; no build runs
    Chat { reply: String },
    /// Code change request
    Architect { needs_backend: bool },
}

pub struct IntentRouter {
    oracle: Arc<dyn Oracle>,
    envelope: CallEnvelope,
    assume_backend_when_ambiguous: bool,
}

impl IntentRouter {
    pub fn new(oracle: Arc<dyn Oracle>, envelope: CallEnvelope) -> Self {
        Self {
            oracle,
            envelope,
            assume_backend_when_ambiguous: true,
        }
    }

    pub fn with_backend_default(mut self, assume_backend: bool) -> Self {
        self.assume_backend_when_ambiguous = assume_backend;
        self
    }

    /// Route `message` given the trailing conversation `history`.
    ///
    /// Classification failures degrade to defaults; only cancellation and a
    /// failed chat reply are returned as errors.
    pub async fn route(
        &self,
        message: &str,
        history: &[Message],
        cancel: &CancellationToken,
    ) -> Result<RouteDecision, EnvelopeError> {
        let context = render_context(message, history);

        let intent = self.classify(&context, cancel).await?;
        tracing::info!("Routing decision: {}", intent.as_str());

        match intent {
            Intent::Chat => {
                let reply = self.chat_reply(&context, cancel).await?;
                Ok(RouteDecision::Chat { reply })
            }
            Intent::Architect => {
                let needs_backend = self.detect_backend_need(&context, cancel).await?;
                Ok(RouteDecision::Architect { needs_backend })
            }
        }
    }

    async fn classify(
        &self,
        context: &str,
        cancel: &CancellationToken,
    ) -> Result<Intent, EnvelopeError> {
        let request = OracleRequest::new(OracleTask::Classify, context)
            .with_system(CLASSIFY_INSTRUCTION)
            .with_schema(json!({"type": "STRING", "enum": ["ARCHITECT", "CHAT"]}))
            .with_temperature(CLASSIFY_TEMPERATURE);

        match self.envelope.generate(self.oracle.as_ref(), &request, cancel).await {
            Ok(response) => Ok(parse_intent(&response.text).unwrap_or_else(|| {
                tracing::warn!("Unreadable intent classification {:?}; treating as architect", response.text);
                Intent::Architect
            })),
            Err(EnvelopeError::Cancelled) => Err(EnvelopeError::Cancelled),
            Err(e) => {
                tracing::warn!("Intent classification failed, treating as architect: {}", e);
                Ok(Intent::Architect)
            }
        }
    }

    async fn detect_backend_need(
        &self,
        context: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, EnvelopeError> {
        let request = OracleRequest::new(OracleTask::DetectBackend, context)
            .with_system(BACKEND_INSTRUCTION)
            .with_schema(json!({
                "type": "OBJECT",
                "properties": {"requiresDatabase": {"type": "BOOLEAN"}},
                "required": ["requiresDatabase"]
            }))
            .with_temperature(CLASSIFY_TEMPERATURE);

        let fallback = self.assume_backend_when_ambiguous;
        match self.envelope.generate(self.oracle.as_ref(), &request, cancel).await {
            Ok(response) => Ok(match response.json::<BackendNeed>() {
                Ok(BackendNeed { requires_database: Some(value) }) => value,
                _ => {
                    tracing::warn!("Ambiguous backend classification; assuming {}", fallback);
                    fallback
                }
            }),
            Err(EnvelopeError::Cancelled) => Err(EnvelopeError::Cancelled),
            Err(e) => {
                tracing::warn!("Backend classification failed, assuming {}: {}", fallback, e);
                Ok(fallback)
            }
        }
    }

    async fn chat_reply(
        &self,
        context: &str,
        cancel: &CancellationToken,
    ) -> Result<String, EnvelopeError> {
        let request = OracleRequest::new(OracleTask::Chat, context)
            .with_system(CHAT_INSTRUCTION)
            .with_temperature(CHAT_TEMPERATURE);
        let response = self
            .envelope
            .generate(self.oracle.as_ref(), &request, cancel)
            .await?;
        Ok(response.text.trim().to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackendNeed {
    #[serde(default)]
    requires_database: Option<bool>,
}

fn parse_intent(text: &str) -> Option<Intent> {
    let token = text
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`')
        .trim()
        .to_ascii_uppercase();
    let architect = token.contains("ARCHITECT");
    let chat = token.contains("CHAT");
    match (architect, chat) {
        (true, false) => Some(Intent::Architect),
        (false, true) => Some(Intent::Chat),
        _ => None,
    }
}

fn render_context(message: &str, history: &[Message]) -> String {
    let mut context = String::new();
    if !history.is_empty() {
        context.push_str("Previous messages:\n");
        for m in history {
            context.push_str(&format!("{}: {}\n", m.role.as_str(), m.content));
        }
        context.push('\n');
    }
    context.push_str(&format!("Latest message: {message}"));
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::ScriptedOracle;
    use std::time::Duration;

    fn router(oracle: ScriptedOracle) -> (IntentRouter, Arc<ScriptedOracle>) {
        let oracle = Arc::new(oracle);
        let envelope = CallEnvelope::new(0, Duration::from_millis(1), Duration::from_secs(5));
        (IntentRouter::new(oracle.clone(), envelope), oracle)
    }

    #[test]
    fn test_parse_intent_tokens() {
        assert_eq!(parse_intent("ARCHITECT"), Some(Intent::Architect));
        assert_eq!(parse_intent("\"chat\"\n"), Some(Intent::Chat));
        assert_eq!(parse_intent("maybe"), None);
        assert_eq!(parse_intent("ARCHITECT or CHAT"), None);
    }

    #[tokio::test]
    async fn test_chat_short_circuits_with_reply() {
        let (router, oracle) = router(
            ScriptedOracle::new()
                .reply(OracleTask::Classify, "CHAT")
                .reply(OracleTask::Chat, " Hello there! "),
        );
        let decision = router
            .route("what can you do?", &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(decision, RouteDecision::Chat { reply: "Hello there!".into() });
        assert_eq!(oracle.call_count(OracleTask::DetectBackend), 0);
        let chat = &oracle.calls_for(OracleTask::Chat)[0];
        assert!(chat.temperature.unwrap() > 0.5);
    }

    #[tokio::test]
    async fn test_architect_reads_backend_flag() {
        let (router, _) = router(
            ScriptedOracle::new()
                .reply(OracleTask::Classify, "ARCHITECT")
                .reply(OracleTask::DetectBackend, r#"{"requiresDatabase": false}"#),
        );
        let decision = router
            .route("make the header blue", &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(decision, RouteDecision::Architect { needs_backend: false });
    }

    #[tokio::test]
    async fn test_ambiguous_backend_defaults_to_true() {
        let (router, _) = router(
            ScriptedOracle::new()
                .reply(OracleTask::Classify, "ARCHITECT")
                .reply(OracleTask::DetectBackend, "{}"),
        );
        let decision = router
            .route("add a guestbook", &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(decision, RouteDecision::Architect { needs_backend: true });
    }

    #[tokio::test]
    async fn test_backend_default_is_tunable() {
        let (router, _) = router(
            ScriptedOracle::new()
                .reply(OracleTask::Classify, "ARCHITECT")
                .fail(OracleTask::DetectBackend, "timeout"),
        );
        let router = router.with_backend_default(false);
        let decision = router
            .route("add a guestbook", &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(decision, RouteDecision::Architect { needs_backend: false });
    }

    #[tokio::test]
    async fn test_classification_failure_routes_to_architect() {
        let (router, _) = router(
            ScriptedOracle::new()
                .fail(OracleTask::Classify, "down")
                .reply(OracleTask::DetectBackend, r#"{"requiresDatabase": true}"#),
        );
        let decision = router
            .route("build a blog", &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(decision, RouteDecision::Architect { needs_backend: true });
    }

    #[tokio::test]
    async fn test_history_is_included_in_prompt() {
        let (router, oracle) = router(
            ScriptedOracle::new()
                .reply(OracleTask::Classify, "CHAT")
                .reply(OracleTask::Chat, "ok"),
        );
        let history = vec![Message::assistant("I added a navbar.")];
        router
            .route("thanks!", &history, &CancellationToken::new())
            .await
            .unwrap();
        let prompt = &oracle.calls_for(OracleTask::Classify)[0].prompt;
        assert!(prompt.contains("assistant: I added a navbar."));
        assert!(prompt.ends_with("Latest message: thanks!"));
    }
}
