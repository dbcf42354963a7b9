//! Language model provider contract.
//!
//! The runtime consumes providers through [`LanguageModel`]: a streaming
//! call yielding low-level [`StreamPart`]s and a non-streaming equivalent.
//! Concrete adapters (HTTP clients for hosted models) live outside the core;
//! the crate ships a scripted [`mock::MockProvider`] for tests and
//! embedding.

pub mod mock;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use futures::StreamExt as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::id::ToolCallId;
use crate::message::{Message, ToolCallPart, ToolResultPart};
use crate::tool::ToolDefinition;
use crate::usage::Usage;

/// Why a step's model response ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum FinishReason {
    /// Natural end of the response.
    Stop,
    /// Token limit reached.
    Length,
    /// Response truncated by the provider's content filter.
    ContentFilter,
    /// The model requested tool calls.
    ToolCalls,
    /// The provider reported an error.
    Error,
    /// Any other provider-specific reason.
    Other,
}

impl FinishReason {
    /// Whether this reason terminates the run when no tool calls were made.
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(self, Self::Stop | Self::Length | Self::ContentFilter)
    }
}

/// A low-level part of a streamed model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
#[non_exhaustive]
pub enum StreamPart {
    /// Stream opened.
    Start,
    /// A reasoning/generation step begins.
    StartStep,
    /// Incremental text content.
    TextDelta {
        /// The text fragment.
        delta: String,
    },
    /// Incremental reasoning content.
    ReasoningDelta {
        /// The reasoning fragment.
        delta: String,
    },
    /// A tool call's argument stream begins.
    ToolInputStart {
        /// Tool call id.
        id: ToolCallId,
        /// Tool name.
        name: String,
    },
    /// Incremental tool call arguments.
    ToolInputDelta {
        /// Tool call id.
        id: ToolCallId,
        /// Raw argument fragment.
        delta: String,
    },
    /// A complete tool call.
    ToolCall(ToolCallPart),
    /// A provider-side tool result (rare; results are usually synthesized
    /// by the dispatcher).
    ToolResult(ToolResultPart),
    /// A step finished.
    FinishStep {
        /// Why the step ended.
        finish_reason: FinishReason,
        /// Usage for the step.
        #[serde(default)]
        usage: Usage,
    },
    /// The response finished.
    Finish {
        /// Why the response ended.
        finish_reason: FinishReason,
        /// Usage for the response.
        #[serde(default)]
        usage: Usage,
    },
}

/// A request for one model step.
#[derive(Debug, Clone, Default)]
pub struct StepRequest {
    /// System instructions, if any.
    pub system: Option<String>,
    /// Conversation history.
    pub messages: Vec<Message>,
    /// Tools the model may call.
    pub tools: Vec<ToolDefinition>,
    /// JSON schema the final output must satisfy, if any.
    pub output_schema: Option<Value>,
}

/// A fully aggregated model response for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    /// Concatenated text content.
    pub text: Option<String>,
    /// Concatenated reasoning content.
    pub reasoning: Option<String>,
    /// Tool calls requested by the model.
    pub tool_calls: Vec<ToolCallPart>,
    /// Why the response ended.
    pub finish_reason: FinishReason,
    /// Token usage for the step.
    pub usage: Usage,
}

/// Boxed stream of model response parts.
pub type PartStream = Pin<Box<dyn Stream<Item = Result<StreamPart>> + Send>>;

/// A language model the runtime can drive.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Identifier of the underlying model, for logging and step records.
    fn model_id(&self) -> &str;

    /// Stream the model response for one step.
    async fn stream(&self, request: StepRequest) -> Result<PartStream>;

    /// Non-streaming equivalent; the default drains [`LanguageModel::stream`].
    async fn complete(&self, request: StepRequest) -> Result<StepResponse> {
        let mut parts = self.stream(request).await?;
        let mut aggregator = PartAggregator::new();
        while let Some(part) = parts.next().await {
            aggregator.apply(&part?);
        }
        Ok(aggregator.into_response())
    }
}

/// Accumulates [`StreamPart`]s into a [`StepResponse`].
#[derive(Debug, Default)]
pub struct PartAggregator {
    text: String,
    reasoning: String,
    tool_calls: Vec<ToolCallPart>,
    finish_reason: Option<FinishReason>,
    usage: Usage,
}

impl PartAggregator {
    /// Create an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one part into the accumulated response.
    pub fn apply(&mut self, part: &StreamPart) {
        match part {
            StreamPart::TextDelta { delta } => self.text.push_str(delta),
            StreamPart::ReasoningDelta { delta } => self.reasoning.push_str(delta),
            StreamPart::ToolCall(call) => self.tool_calls.push(call.clone()),
            StreamPart::Finish {
                finish_reason,
                usage,
            } => {
                self.finish_reason = Some(*finish_reason);
                self.usage += *usage;
            }
            StreamPart::FinishStep { usage, .. } => self.usage += *usage,
            StreamPart::Start
            | StreamPart::StartStep
            | StreamPart::ToolInputStart { .. }
            | StreamPart::ToolInputDelta { .. }
            | StreamPart::ToolResult(_) => {}
        }
    }

    /// Finish aggregation.
    #[must_use]
    pub fn into_response(self) -> StepResponse {
        let finish_reason = self.finish_reason.unwrap_or_else(|| {
            if self.tool_calls.is_empty() {
                FinishReason::Stop
            } else {
                FinishReason::ToolCalls
            }
        });
        StepResponse {
            text: (!self.text.is_empty()).then_some(self.text),
            reasoning: (!self.reasoning.is_empty()).then_some(self.reasoning),
            tool_calls: self.tool_calls,
            finish_reason,
            usage: self.usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod finish_reason {
        use super::*;

        #[test]
        fn final_reasons() {
            assert!(FinishReason::Stop.is_final());
            assert!(FinishReason::Length.is_final());
            assert!(FinishReason::ContentFilter.is_final());
            assert!(!FinishReason::ToolCalls.is_final());
            assert!(!FinishReason::Error.is_final());
        }

        #[test]
        fn serde_uses_kebab_case() {
            let json = serde_json::to_string(&FinishReason::ContentFilter).unwrap();
            assert_eq!(json, r#""content-filter""#);
            let json = serde_json::to_string(&FinishReason::ToolCalls).unwrap();
            assert_eq!(json, r#""tool-calls""#);
        }
    }

    mod aggregator {
        use super::*;

        #[test]
        fn accumulates_text_deltas() {
            let mut agg = PartAggregator::new();
            agg.apply(&StreamPart::TextDelta {
                delta: "Hello, ".to_owned(),
            });
            agg.apply(&StreamPart::TextDelta {
                delta: "world!".to_owned(),
            });
            agg.apply(&StreamPart::Finish {
                finish_reason: FinishReason::Stop,
                usage: Usage::new(10, 2),
            });
            let response = agg.into_response();
            assert_eq!(response.text.as_deref(), Some("Hello, world!"));
            assert_eq!(response.finish_reason, FinishReason::Stop);
            assert_eq!(response.usage, Usage::new(10, 2));
        }

        #[test]
        fn collects_tool_calls_in_order() {
            let mut agg = PartAggregator::new();
            for name in ["a", "b"] {
                agg.apply(&StreamPart::ToolCall(ToolCallPart::new(
                    ToolCallId::new(name),
                    name,
                    Value::Null,
                )));
            }
            let response = agg.into_response();
            let names: Vec<&str> = response
                .tool_calls
                .iter()
                .map(|c| c.name.as_str())
                .collect();
            assert_eq!(names, ["a", "b"]);
            assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        }

        #[test]
        fn missing_finish_defaults_to_stop_without_calls() {
            let response = PartAggregator::new().into_response();
            assert_eq!(response.finish_reason, FinishReason::Stop);
            assert_eq!(response.text, None);
        }

        #[test]
        fn finish_step_usage_is_summed() {
            let mut agg = PartAggregator::new();
            agg.apply(&StreamPart::FinishStep {
                finish_reason: FinishReason::ToolCalls,
                usage: Usage::new(5, 1),
            });
            agg.apply(&StreamPart::Finish {
                finish_reason: FinishReason::Stop,
                usage: Usage::new(7, 3),
            });
            assert_eq!(agg.into_response().usage, Usage::new(12, 4));
        }
    }
}
