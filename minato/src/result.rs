//! Run inputs and results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorDetail;
use crate::id::{ApprovalId, RunId};
use crate::message::Message;
use crate::state::{SuspensionStack, ToolApprovalSuspension};
use crate::usage::Usage;

/// The caller's input to one `run`/`stream` invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AgentInput {
    /// Fresh start: a new run id is generated and a new state created.
    Request {
        /// The user prompt.
        prompt: String,
    },
    /// Follow-up turn on a completed run.
    Reply {
        /// The run to continue.
        run_id: RunId,
        /// The user message to append.
        message: Message,
    },
    /// Resume a suspended run with an approval decision.
    Approval {
        /// The run to resume.
        run_id: RunId,
        /// The decision.
        response: ApprovalResponse,
    },
    /// Re-drive a run still marked running (e.g. after a crash).
    Continue {
        /// The run to re-drive.
        run_id: RunId,
    },
}

impl AgentInput {
    /// Fresh-start input from a prompt.
    #[must_use]
    pub fn request(prompt: impl Into<String>) -> Self {
        Self::Request {
            prompt: prompt.into(),
        }
    }

    /// Reply input from plain text.
    #[must_use]
    pub fn reply_text(run_id: RunId, text: impl Into<String>) -> Self {
        Self::Reply {
            run_id,
            message: Message::user(text),
        }
    }

    /// Approval input.
    #[must_use]
    pub fn approval(run_id: RunId, response: ApprovalResponse) -> Self {
        Self::Approval { run_id, response }
    }

    /// The run id addressed by this input, absent for fresh requests.
    #[must_use]
    pub fn run_id(&self) -> Option<&RunId> {
        match self {
            Self::Request { .. } => None,
            Self::Reply { run_id, .. }
            | Self::Approval { run_id, .. }
            | Self::Continue { run_id } => Some(run_id),
        }
    }
}

/// An approval decision for one pending suspension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    /// The approval being decided.
    pub approval_id: ApprovalId,
    /// Whether the tool call may proceed.
    pub approved: bool,
    /// Optional reason, surfaced to the model on denial.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ApprovalResponse {
    /// Approve the given approval id.
    #[must_use]
    pub fn approve(approval_id: ApprovalId) -> Self {
        Self {
            approval_id,
            approved: true,
            reason: None,
        }
    }

    /// Deny the given approval id with an optional reason.
    #[must_use]
    pub fn deny(approval_id: ApprovalId, reason: Option<String>) -> Self {
        Self {
            approval_id,
            approved: false,
            reason,
        }
    }
}

/// Terminal (or durable-pause) outcome of one `run`/`stream` invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AgentRunResult {
    /// The run reached a final answer.
    Complete {
        /// The run id.
        run_id: RunId,
        /// Final output; structured when the manifest declares a schema,
        /// otherwise the final text as a JSON string.
        output: Value,
        /// Final text content, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        /// Aggregate token usage for this invocation.
        usage: Usage,
    },
    /// The run paused awaiting approvals.
    Suspended {
        /// The run id to resume against.
        run_id: RunId,
        /// Approvals owned by the run itself.
        suspensions: Vec<ToolApprovalSuspension>,
        /// Approvals held by descendant sub-agents.
        suspension_stacks: Vec<SuspensionStack>,
    },
    /// The run failed.
    Error {
        /// The run id.
        run_id: RunId,
        /// The terminal error.
        error: ErrorDetail,
    },
    /// The run was cancelled.
    Cancelled {
        /// The run id.
        run_id: RunId,
    },
}

impl AgentRunResult {
    /// The run id this result belongs to.
    #[must_use]
    pub const fn run_id(&self) -> &RunId {
        match self {
            Self::Complete { run_id, .. }
            | Self::Suspended { run_id, .. }
            | Self::Error { run_id, .. }
            | Self::Cancelled { run_id } => run_id,
        }
    }

    /// Status string matching the serialized `status` tag.
    #[must_use]
    pub const fn status(&self) -> &'static str {
        match self {
            Self::Complete { .. } => "complete",
            Self::Suspended { .. } => "suspended",
            Self::Error { .. } => "error",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// Whether the run reached a final answer.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }

    /// Whether the run is paused awaiting approvals.
    #[must_use]
    pub const fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended { .. })
    }

    /// All approval ids a caller could resume this result with.
    #[must_use]
    pub fn pending_approval_ids(&self) -> Vec<ApprovalId> {
        match self {
            Self::Suspended {
                suspensions,
                suspension_stacks,
                ..
            } => suspensions
                .iter()
                .map(|s| s.approval_id.clone())
                .chain(
                    suspension_stacks
                        .iter()
                        .map(|stack| stack.leaf_suspension.approval_id.clone()),
                )
                .collect(),
            Self::Complete { .. } | Self::Error { .. } | Self::Cancelled { .. } => Vec::new(),
        }
    }
}

/// Outcome of a `cancel` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum CancelOutcome {
    /// The run was transitioned to cancelled directly.
    Cancelled {
        /// The run id.
        run_id: RunId,
    },
    /// A cancellation signal was written; the run will observe it at its
    /// next poll point.
    Signalled {
        /// The run id.
        run_id: RunId,
    },
    /// The run was already in a terminal state.
    AlreadyTerminal {
        /// The run id.
        run_id: RunId,
    },
}
