// Code-generation oracle
//
// The oracle is the external LLM-backed completion service. Everything above
// this module talks to it through the `Oracle` trait and the `CallEnvelope`,
// which is the only place transport failures are retried.

use anyhow::Result;
use async_trait::async_trait;

pub mod envelope;
pub mod gemini;
pub mod scripted;
pub mod types;

pub use envelope::{CallEnvelope, EnvelopeError};
pub use gemini::GeminiOracle;
pub use scripted::ScriptedOracle;
pub use types::{parse_json, OracleRequest, OracleResponse, OracleTask};

/// Text/JSON generation service
///
/// Implementations must support a constrained mode (when `request.schema` is
/// set, the response text is JSON matching the schema) and a free-text mode.
/// Transport and timeout failures are returned as errors; callers wrap calls
/// in a `CallEnvelope`.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn generate(&self, request: &OracleRequest) -> Result<OracleResponse>;

    /// Name for logging
    fn name(&self) -> &str;
}
