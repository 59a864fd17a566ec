//! Test doubles and fixtures shared by the Troupe crates.
//!
//! [`MockBackend`] stands in for a generation backend: outcomes are
//! scripted per call or keyed on the task being prompted, and every
//! request is recorded for assertions.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use troupe_core::error::{BackendError, Result};
use troupe_core::traits::GenerationBackend;
use troupe_core::types::{AgentSpec, GenerationRequest, TaskSpec};

/// What a scripted backend call should produce.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Succeed with this text.
    Text(String),
    /// Fail with a transient error (retry-eligible).
    Transient(String),
    /// Fail with a fatal error (never retried).
    Fatal(String),
    /// Succeed with this text after a delay. Uses the tokio clock, so
    /// paused-time tests complete instantly.
    Slow { text: String, delay_ms: u64 },
}

#[derive(Default)]
struct MockState {
    queue: VecDeque<MockOutcome>,
    requests: Vec<GenerationRequest>,
}

/// Scripted [`GenerationBackend`].
///
/// Each call resolves its outcome in order: the first keyed outcome whose
/// key appears in the prompt's leading description, then the front of the
/// queue, then the default response. Keys are matched against the text
/// before the first blank line only; dependency context quotes upstream
/// descriptions, which would otherwise re-match their keys downstream.
#[derive(Default)]
pub struct MockBackend {
    keyed: Vec<(String, MockOutcome)>,
    default_response: Option<String>,
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that consumes `outcomes` front to back, one per call.
    pub fn with_queue(outcomes: Vec<MockOutcome>) -> Self {
        Self {
            state: Mutex::new(MockState {
                queue: outcomes.into(),
                requests: Vec::new(),
            }),
            ..Self::default()
        }
    }

    /// Text returned when neither a key nor a queued outcome applies.
    pub fn with_default_response(mut self, text: impl Into<String>) -> Self {
        self.default_response = Some(text.into());
        self
    }

    /// Outcome for any call whose prompt description contains `key`.
    /// Keyed outcomes are not consumed; earlier keys win.
    pub fn with_keyed_outcome(mut self, key: impl Into<String>, outcome: MockOutcome) -> Self {
        self.keyed.push((key.into(), outcome));
        self
    }

    /// Number of calls that reached the backend.
    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    /// Every recorded request, in call order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    fn resolve(&self, request: &GenerationRequest) -> Option<MockOutcome> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());

        let head = request.prompt.split("\n\n").next().unwrap_or("");
        self.keyed
            .iter()
            .find(|(key, _)| head.contains(key.as_str()))
            .map(|(_, outcome)| outcome.clone())
            .or_else(|| state.queue.pop_front())
            .or_else(|| self.default_response.clone().map(MockOutcome::Text))
    }
}

impl GenerationBackend for MockBackend {
    fn generate(&self, request: GenerationRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            match self.resolve(&request) {
                Some(MockOutcome::Text(text)) => Ok(text),
                Some(MockOutcome::Slow { text, delay_ms }) => {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    Ok(text)
                }
                Some(MockOutcome::Transient(message)) => {
                    Err(BackendError::Transient(message).into())
                }
                Some(MockOutcome::Fatal(message)) => Err(BackendError::Fatal(message).into()),
                None => Err(BackendError::Fatal(format!(
                    "MockBackend has no outcome scripted for prompt: {:.60}",
                    request.prompt
                ))
                .into()),
            }
        })
    }
}

/// Agent spec with placeholder persona text and default limits.
pub fn agent(id: &str) -> AgentSpec {
    AgentSpec::new(id, format!("{id} role"), format!("{id} goal"))
}

/// Task spec with a placeholder description and no dependencies.
pub fn task(id: &str, agent: &str) -> TaskSpec {
    TaskSpec::new(id, format!("{id} work"), agent)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            agent_id: "a".to_string(),
            system: String::new(),
            prompt: prompt.to_string(),
            tools: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_keyed_outcome_ignores_context_sections() {
        let mock = MockBackend::new()
            .with_keyed_outcome("gather", MockOutcome::Text("facts".to_string()))
            .with_keyed_outcome("write", MockOutcome::Text("article".to_string()));

        // A downstream prompt quotes the upstream description in its
        // context block; only the leading description may match.
        let downstream = "write the piece\n\n## Context\n\n### research: gather sources\n\nfacts\n";
        let output = mock.generate(request(downstream)).await.unwrap();
        assert_eq!(output, "article");
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_queue_consumed_in_order_then_default() {
        let mock = MockBackend::with_queue(vec![
            MockOutcome::Text("first".to_string()),
            MockOutcome::Transient("blip".to_string()),
        ])
        .with_default_response("fallback");

        assert_eq!(mock.generate(request("x")).await.unwrap(), "first");
        assert!(mock.generate(request("x")).await.is_err());
        assert_eq!(mock.generate(request("x")).await.unwrap(), "fallback");
        assert_eq!(mock.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_unscripted_call_fails_fatally() {
        let mock = MockBackend::new();
        let err = mock.generate(request("anything")).await.unwrap_err();
        assert!(err.to_string().contains("no outcome scripted"));
    }
}
