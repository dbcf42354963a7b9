//! Streaming events emitted during agent execution.
//!
//! Events come in two categories. *Filterable* events carry model-level
//! detail (text deltas, tool calls, step boundaries) and pass through only
//! when their kind is listed in the emitting manifest's `streaming_events`.
//! *Lifecycle* events (`agent-*`, `sub-agent-*`) are always emitted.
//!
//! Every event is tagged with the emitting agent's manifest id and, for
//! events that originate inside a sub-agent run, the direct invoker's
//! manifest id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorDetail;
use crate::id::{AgentId, ApprovalId, RunId, ToolCallId};
use crate::message::{ToolCallPart, ToolResultPart};
use crate::provider::FinishReason;

/// The kind of an [`AgentEvent`], used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum EventKind {
    /// Incremental text content.
    TextDelta,
    /// A complete tool call.
    ToolCall,
    /// A tool call's argument stream begins.
    ToolInputStart,
    /// Incremental tool call arguments.
    ToolInputDelta,
    /// A tool invocation finished.
    ToolResult,
    /// Incremental reasoning content.
    ReasoningDelta,
    /// A step begins.
    StepStart,
    /// A step finished.
    StepFinish,
    /// The run started executing.
    AgentStarted,
    /// The run completed.
    AgentDone,
    /// The run failed.
    AgentError,
    /// The run paused awaiting approvals.
    AgentSuspended,
    /// The run was cancelled.
    AgentCancelled,
    /// Cancellation was observed and the run is unwinding.
    AgentCancelling,
    /// A sub-agent run begins.
    SubAgentStart,
    /// A sub-agent run finished.
    SubAgentEnd,
}

impl EventKind {
    /// Whether this kind is subject to the manifest's event filter.
    /// Lifecycle kinds are always emitted.
    #[must_use]
    pub const fn is_filterable(&self) -> bool {
        matches!(
            self,
            Self::TextDelta
                | Self::ToolCall
                | Self::ToolInputStart
                | Self::ToolInputDelta
                | Self::ToolResult
                | Self::ReasoningDelta
                | Self::StepStart
                | Self::StepFinish
        )
    }
}

/// Payload of one streaming event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
#[non_exhaustive]
pub enum EventPayload {
    /// Incremental text content.
    TextDelta {
        /// The text fragment.
        delta: String,
    },
    /// A complete tool call.
    ToolCall {
        /// The call.
        call: ToolCallPart,
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
    /// A tool invocation finished.
    ToolResult {
        /// The result part.
        result: ToolResultPart,
    },
    /// Incremental reasoning content.
    ReasoningDelta {
        /// The reasoning fragment.
        delta: String,
    },
    /// A step begins.
    StepStart {
        /// Step number, 1-based.
        step: u32,
    },
    /// A step finished.
    StepFinish {
        /// Step number, 1-based.
        step: u32,
        /// Why the step ended.
        finish_reason: FinishReason,
    },
    /// The run started executing.
    AgentStarted {
        /// Run id.
        run_id: RunId,
    },
    /// The run completed.
    AgentDone {
        /// Run id.
        run_id: RunId,
    },
    /// The run failed.
    AgentError {
        /// Run id.
        run_id: RunId,
        /// The terminal error.
        error: ErrorDetail,
    },
    /// The run paused awaiting approvals.
    AgentSuspended {
        /// Run id.
        run_id: RunId,
        /// Approval ids newly awaiting a decision.
        approval_ids: Vec<ApprovalId>,
    },
    /// The run was cancelled.
    AgentCancelled {
        /// Run id.
        run_id: RunId,
    },
    /// Cancellation was observed and the run is unwinding.
    AgentCancelling {
        /// Run id.
        run_id: RunId,
    },
    /// A sub-agent run begins.
    SubAgentStart {
        /// Synthesized tool name of the sub-agent.
        name: String,
        /// Manifest id of the sub-agent.
        manifest_id: AgentId,
    },
    /// A sub-agent run finished.
    SubAgentEnd {
        /// Synthesized tool name of the sub-agent.
        name: String,
        /// Manifest id of the sub-agent.
        manifest_id: AgentId,
        /// Terminal status of the sub-agent run.
        status: String,
    },
}

impl EventPayload {
    /// The kind of this payload.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::TextDelta { .. } => EventKind::TextDelta,
            Self::ToolCall { .. } => EventKind::ToolCall,
            Self::ToolInputStart { .. } => EventKind::ToolInputStart,
            Self::ToolInputDelta { .. } => EventKind::ToolInputDelta,
            Self::ToolResult { .. } => EventKind::ToolResult,
            Self::ReasoningDelta { .. } => EventKind::ReasoningDelta,
            Self::StepStart { .. } => EventKind::StepStart,
            Self::StepFinish { .. } => EventKind::StepFinish,
            Self::AgentStarted { .. } => EventKind::AgentStarted,
            Self::AgentDone { .. } => EventKind::AgentDone,
            Self::AgentError { .. } => EventKind::AgentError,
            Self::AgentSuspended { .. } => EventKind::AgentSuspended,
            Self::AgentCancelled { .. } => EventKind::AgentCancelled,
            Self::AgentCancelling { .. } => EventKind::AgentCancelling,
            Self::SubAgentStart { .. } => EventKind::SubAgentStart,
            Self::SubAgentEnd { .. } => EventKind::SubAgentEnd,
        }
    }
}

/// A timestamped, attributed streaming event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    /// The payload.
    #[serde(flatten)]
    pub payload: EventPayload,
    /// Manifest id of the agent that emitted the event.
    pub manifest_id: AgentId,
    /// Manifest id of the direct invoker, set iff the event originates from
    /// a sub-agent run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_manifest_id: Option<AgentId>,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Monotonic per-stream sequence number.
    pub sequence: u64,
}

impl AgentEvent {
    /// The kind of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod kind {
        use super::*;

        #[test]
        fn model_detail_kinds_are_filterable() {
            for kind in [
                EventKind::TextDelta,
                EventKind::ToolCall,
                EventKind::ToolInputStart,
                EventKind::ToolInputDelta,
                EventKind::ToolResult,
                EventKind::ReasoningDelta,
                EventKind::StepStart,
                EventKind::StepFinish,
            ] {
                assert!(kind.is_filterable(), "{kind:?} should be filterable");
            }
        }

        #[test]
        fn lifecycle_kinds_are_always_emitted() {
            for kind in [
                EventKind::AgentStarted,
                EventKind::AgentDone,
                EventKind::AgentError,
                EventKind::AgentSuspended,
                EventKind::AgentCancelled,
                EventKind::AgentCancelling,
                EventKind::SubAgentStart,
                EventKind::SubAgentEnd,
            ] {
                assert!(!kind.is_filterable(), "{kind:?} should not be filterable");
            }
        }

        #[test]
        fn serde_uses_kebab_case() {
            let json = serde_json::to_string(&EventKind::SubAgentStart).unwrap();
            assert_eq!(json, r#""sub-agent-start""#);
        }
    }

    mod event {
        use super::*;

        fn sample() -> AgentEvent {
            AgentEvent {
                payload: EventPayload::TextDelta {
                    delta: "hi".to_owned(),
                },
                manifest_id: AgentId::new("leaf"),
                parent_manifest_id: Some(AgentId::new("root")),
                timestamp: Utc::now(),
                sequence: 7,
            }
        }

        #[test]
        fn kind_is_derived_from_payload() {
            assert_eq!(sample().kind(), EventKind::TextDelta);
        }

        #[test]
        fn payload_is_flattened_in_json() {
            let json = serde_json::to_value(sample()).unwrap();
            assert_eq!(json["type"], "text-delta");
            assert_eq!(json["delta"], "hi");
            assert_eq!(json["manifest_id"], "leaf");
            assert_eq!(json["parent_manifest_id"], "root");
        }

        #[test]
        fn roundtrips_through_serde() {
            let event = sample();
            let json = serde_json::to_string(&event).unwrap();
            let parsed: AgentEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, event);
        }

        #[test]
        fn parent_is_omitted_when_absent() {
            let mut event = sample();
            event.parent_manifest_id = None;
            let json = serde_json::to_value(event).unwrap();
            assert!(json.get("parent_manifest_id").is_none());
        }
    }
}
