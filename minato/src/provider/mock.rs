//! Scripted provider for testing.
//!
//! Returns predefined part sequences step by step, so loop behaviour can be
//! exercised deterministically without a real model.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use super::{FinishReason, LanguageModel, PartStream, StepRequest, StreamPart};
use crate::error::{Error, Result};
use crate::id::ToolCallId;
use crate::message::ToolCallPart;
use crate::usage::Usage;

/// A scripted model: each call to [`LanguageModel::stream`] plays the next
/// step's parts. Calling past the script replays the last step.
pub struct MockProvider {
    model_id: String,
    steps: Vec<Vec<StreamPart>>,
    next_step: AtomicUsize,
    requests: Mutex<Vec<StepRequest>>,
    fail_with: Option<String>,
}

impl std::fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProvider")
            .field("model_id", &self.model_id)
            .field("steps", &self.steps.len())
            .finish_non_exhaustive()
    }
}

impl MockProvider {
    /// Create a provider that plays the given step scripts in order.
    #[must_use]
    pub fn new(steps: Vec<Vec<StreamPart>>) -> Self {
        Self {
            model_id: "mock-model".to_owned(),
            steps,
            next_step: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            fail_with: None,
        }
    }

    /// Create a provider whose every call fails with the given message.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            model_id: "mock-model".to_owned(),
            steps: Vec::new(),
            next_step: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            fail_with: Some(message.into()),
        }
    }

    /// Override the reported model id.
    #[must_use]
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    /// A single step that emits text deltas then finishes with `stop`.
    #[must_use]
    pub fn text_step(chunks: &[&str]) -> Vec<StreamPart> {
        let mut parts = vec![StreamPart::Start, StreamPart::StartStep];
        parts.extend(chunks.iter().map(|chunk| StreamPart::TextDelta {
            delta: (*chunk).to_owned(),
        }));
        parts.push(StreamPart::Finish {
            finish_reason: FinishReason::Stop,
            usage: Usage::new(10, 5),
        });
        parts
    }

    /// A single step that requests the given tool calls.
    #[must_use]
    pub fn tool_step(calls: &[(&str, &str, Value)]) -> Vec<StreamPart> {
        let mut parts = vec![StreamPart::Start, StreamPart::StartStep];
        for (id, name, args) in calls {
            parts.push(StreamPart::ToolInputStart {
                id: ToolCallId::new(*id),
                name: (*name).to_owned(),
            });
            parts.push(StreamPart::ToolCall(ToolCallPart::new(
                ToolCallId::new(*id),
                *name,
                args.clone(),
            )));
        }
        parts.push(StreamPart::Finish {
            finish_reason: FinishReason::ToolCalls,
            usage: Usage::new(10, 5),
        });
        parts
    }

    /// Number of steps requested so far.
    #[must_use]
    pub fn steps_requested(&self) -> usize {
        self.next_step.load(Ordering::SeqCst)
    }

    /// Requests captured so far, for assertions on message history.
    #[must_use]
    pub fn captured_requests(&self) -> Vec<StepRequest> {
        self.requests
            .lock()
            .map(|reqs| reqs.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LanguageModel for MockProvider {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn stream(&self, request: StepRequest) -> Result<PartStream> {
        if let Some(ref message) = self.fail_with {
            return Err(Error::internal(message.clone()));
        }
        if let Ok(mut reqs) = self.requests.lock() {
            reqs.push(request);
        }
        let index = self.next_step.fetch_add(1, Ordering::SeqCst);
        let parts = self
            .steps
            .get(index.min(self.steps.len().saturating_sub(1)))
            .cloned()
            .unwrap_or_default();
        Ok(Box::pin(futures::stream::iter(
            parts.into_iter().map(Ok),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt as _;

    #[tokio::test]
    async fn plays_steps_in_order() {
        let provider = MockProvider::new(vec![
            MockProvider::text_step(&["one"]),
            MockProvider::text_step(&["two"]),
        ]);

        let first = provider.complete(StepRequest::default()).await.unwrap();
        assert_eq!(first.text.as_deref(), Some("one"));

        let second = provider.complete(StepRequest::default()).await.unwrap();
        assert_eq!(second.text.as_deref(), Some("two"));
        assert_eq!(provider.steps_requested(), 2);
    }

    #[tokio::test]
    async fn replays_last_step_past_script() {
        let provider = MockProvider::new(vec![MockProvider::text_step(&["only"])]);
        provider.complete(StepRequest::default()).await.unwrap();
        let replay = provider.complete(StepRequest::default()).await.unwrap();
        assert_eq!(replay.text.as_deref(), Some("only"));
    }

    #[tokio::test]
    async fn failing_provider_errors() {
        let provider = MockProvider::failing("upstream unavailable");
        let err = match provider.stream(StepRequest::default()).await {
            Ok(_) => panic!("expected stream to fail"),
            Err(err) => err,
        };
        assert_eq!(err.message(), "upstream unavailable");
    }

    #[tokio::test]
    async fn tool_step_emits_calls() {
        let provider = MockProvider::new(vec![MockProvider::tool_step(&[(
            "c1",
            "echo",
            serde_json::json!({"x": 5}),
        )])]);
        let mut parts = provider.stream(StepRequest::default()).await.unwrap();
        let mut saw_call = false;
        while let Some(part) = parts.next().await {
            if let StreamPart::ToolCall(call) = part.unwrap() {
                assert_eq!(call.name, "echo");
                saw_call = true;
            }
        }
        assert!(saw_call);
    }

    #[tokio::test]
    async fn captures_requests() {
        let provider = MockProvider::new(vec![MockProvider::text_step(&["hi"])]);
        let request = StepRequest {
            system: Some("be brief".to_owned()),
            ..Default::default()
        };
        provider.complete(request).await.unwrap();
        let captured = provider.captured_requests();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].system.as_deref(), Some("be brief"));
    }
}
