// Scripted oracle — deterministic stand-in for the real service
//
// Responses are queued per task and consumed in order. A responder function can
// be installed for tasks whose output depends on the request. Every request is
// recorded so callers can assert on prompts and call counts.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use super::types::{OracleRequest, OracleResponse, OracleTask};
use super::Oracle;

type Responder = Box<dyn Fn(&OracleRequest) -> Result<String> + Send + Sync>;

#[derive(Default)]
pub struct ScriptedOracle {
    queues: Mutex<HashMap<OracleTask, VecDeque<Result<String, String>>>>,
    responders: Mutex<HashMap<OracleTask, Responder>>,
    calls: Mutex<Vec<OracleRequest>>,
    latency: Option<Duration>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every response (tokio time; pair with paused-clock tests)
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue a successful response for `task`
    pub fn reply(self, task: OracleTask, text: impl Into<String>) -> Self {
        self.enqueue(task, Ok(text.into()));
        self
    }

    /// Queue a failure for `task`
    pub fn fail(self, task: OracleTask, error: impl Into<String>) -> Self {
        self.enqueue(task, Err(error.into()));
        self
    }

    /// Answer every `task` call with `responder` once its queue is empty
    pub fn respond_with<F>(self, task: OracleTask, responder: F) -> Self
    where
        F: Fn(&OracleRequest) -> Result<String> + Send + Sync + 'static,
    {
        if let Ok(mut responders) = self.responders.lock() {
            responders.insert(task, Box::new(responder));
        }
        self
    }

    pub fn enqueue(&self, task: OracleTask, outcome: Result<String, String>) {
        if let Ok(mut queues) = self.queues.lock() {
            queues.entry(task).or_default().push_back(outcome);
        }
    }

    /// All requests received so far
    pub fn calls(&self) -> Vec<OracleRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_for(&self, task: OracleTask) -> Vec<OracleRequest> {
        self.calls()
            .into_iter()
            .filter(|request| request.task == task)
            .collect()
    }

    pub fn call_count(&self, task: OracleTask) -> usize {
        self.calls_for(task).len()
    }

    fn next_outcome(&self, request: &OracleRequest) -> Result<String> {
        let queued = self
            .queues
            .lock()
            .ok()
            .and_then(|mut queues| queues.get_mut(&request.task).and_then(VecDeque::pop_front));

        match queued {
            Some(Ok(text)) => Ok(text),
            Some(Err(error)) => Err(anyhow::anyhow!(error)),
            None => {
                let responders = self
                    .responders
                    .lock()
                    .map_err(|_| anyhow::anyhow!("scripted oracle responders poisoned"))?;
                match responders.get(&request.task) {
                    Some(responder) => responder(request),
                    None => anyhow::bail!(
                        "no scripted response for task '{}'",
                        request.task.as_str()
                    ),
                }
            }
        }
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn generate(&self, request: &OracleRequest) -> Result<OracleResponse> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.next_outcome(request).map(OracleResponse::new)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
