// Call envelope: per-call timeout plus bounded exponential-backoff retry

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use super::types::{OracleRequest, OracleResponse};
use super::Oracle;
use crate::config::EnvelopeConfig;

/// Why an enveloped call did not produce a result
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Every attempt failed or timed out; wraps the last underlying cause
    #[error("oracle call failed after {attempts} attempt(s): {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
    /// The caller's cancellation token fired. Never retried.
    #[error("oracle call cancelled")]
    Cancelled,
}

impl EnvelopeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EnvelopeError::Cancelled)
    }
}

/// Timeout + retry policy wrapped around a single oracle operation.
///
/// The wrapped operation runs at least once and at most `retries + 1` times,
/// so callers must tolerate repeated oracle invocation.
#[derive(Debug, Clone, Copy)]
pub struct CallEnvelope {
    retries: u32,
    initial_delay: Duration,
    timeout: Duration,
}

impl Default for CallEnvelope {
    fn default() -> Self {
        Self {
            retries: 2,
            initial_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(120),
        }
    }
}

impl CallEnvelope {
    pub fn new(retries: u32, initial_delay: Duration, timeout: Duration) -> Self {
        Self {
            retries,
            initial_delay,
            timeout,
        }
    }

    pub fn from_config(config: &EnvelopeConfig) -> Self {
        Self::new(
            config.retries,
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// Same timeout, no retries
    pub fn one_shot(&self) -> Self {
        Self {
            retries: 0,
            ..*self
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Run `op` under the envelope, checking `cancel` around every suspend point.
    pub async fn run<F, Fut, T>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, EnvelopeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let attempts = self.max_attempts();
        let mut delay = self.initial_delay;

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(EnvelopeError::Cancelled);
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EnvelopeError::Cancelled),
                result = timeout(self.timeout, op()) => result,
            };

            let error = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => anyhow::anyhow!("oracle call timed out after {:?}", self.timeout),
            };

            if attempt == attempts {
                return Err(EnvelopeError::Exhausted {
                    attempts,
                    source: error,
                });
            }

            tracing::warn!(
                "Oracle call failed (attempt {}/{}), retrying in {:?}: {}",
                attempt,
                attempts,
                delay,
                error
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EnvelopeError::Cancelled),
                _ = sleep(delay) => {}
            }
            delay = delay.saturating_mul(2);
        }

        unreachable!("envelope always makes at least one attempt")
    }

    /// Convenience wrapper for a single oracle request
    pub async fn generate(
        &self,
        oracle: &dyn Oracle,
        request: &OracleRequest,
        cancel: &CancellationToken,
    ) -> Result<OracleResponse, EnvelopeError> {
        tracing::debug!("Oracle call: {}", request.task.as_str());
        self.run(cancel, || oracle.generate(request)).await
    }
}
