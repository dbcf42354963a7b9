//! Persisted run state.
//!
//! An [`AgentState`] is the durable record of one run: its message history,
//! step records, and — while suspended — the approvals it is waiting on.
//! Direct approvals owned by the agent itself live in `suspensions`;
//! approvals held by descendant sub-agents are tracked as
//! [`SuspensionStack`]s, one per parallel branch, each materializing the
//! path from this state down to the descendant that needs the approval.
//!
//! Completed results of a partially-suspended parallel batch are carried in
//! `pending_tool_results` until every sibling resolves, at which point one
//! tool message holding all results in original tool-call order is appended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{AgentId, ApprovalId, RunId, ToolCallId};
use crate::message::{Message, ToolCallPart, ToolResultPart};
use crate::provider::FinishReason;
use crate::usage::Usage;

/// Version of the persisted state layout.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Paused awaiting one or more approvals.
    Suspended,
    /// Actively executing (or crashed while executing).
    Running,
    /// Reached a final answer.
    Completed,
    /// Terminated with an error.
    Failed,
    /// Terminated by cancellation.
    Cancelled,
}

impl AgentStatus {
    /// Whether no further execution can happen from this status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns the string representation of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Suspended => "suspended",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pending human approval for a sensitive tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolApprovalSuspension {
    /// Identifier the caller must echo to resolve the approval.
    pub approval_id: ApprovalId,
    /// The suspended tool call.
    pub tool_call_id: ToolCallId,
    /// Name of the suspended tool.
    pub tool_name: String,
    /// Arguments of the suspended call.
    pub tool_args: Value,
    /// Human-readable description of what the tool would do.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One hop on the path from a state to a suspended descendant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspensionStackEntry {
    /// Manifest id of the agent at this hop.
    pub manifest_id: AgentId,
    /// Persisted state id of the run at this hop.
    pub state_id: RunId,
    /// Tool call that invoked the next (child) hop; `None` exactly at the
    /// leaf.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_tool_call_id: Option<ToolCallId>,
}

/// Path from a run down to the descendant agent holding an approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspensionStack {
    /// Hops from this run (index 0) down to the suspended descendant.
    /// Non-empty.
    pub agents: Vec<SuspensionStackEntry>,
    /// The approval the leaf agent is waiting on.
    pub leaf_suspension: ToolApprovalSuspension,
}

impl SuspensionStack {
    /// Nesting depth; 1 means the owning run itself holds the approval.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.agents.len()
    }

    /// The leaf hop.
    #[must_use]
    pub fn leaf(&self) -> Option<&SuspensionStackEntry> {
        self.agents.last()
    }
}

/// One completed LLM step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step number, 1-based.
    pub step: u32,
    /// Model that produced the response.
    pub model: String,
    /// Text content of the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Tool calls requested in this step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallPart>,
    /// Why the response ended.
    pub finish_reason: FinishReason,
    /// Token usage for the step.
    pub usage: Usage,
}

/// Durable record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    /// Persisted layout version.
    pub schema_version: u32,
    /// Run id; doubles as the storage key.
    pub id: RunId,
    /// Manifest id at the root of the run tree this state belongs to.
    pub root_manifest_id: AgentId,
    /// Manifest executed by this run.
    pub manifest_id: AgentId,
    /// Version of that manifest.
    pub manifest_version: String,
    /// Parent run when this is a sub-agent run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_state_id: Option<RunId>,
    /// Child runs spawned by this run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_state_ids: Vec<RunId>,
    /// Conversation history. Binary content is offloaded on write.
    pub messages: Vec<Message>,
    /// Completed step records, append-only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepRecord>,
    /// Next step number, 1-based.
    pub current_step_number: u32,
    /// Approvals owned by this agent directly.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suspensions: Vec<ToolApprovalSuspension>,
    /// Approvals held by descendant sub-agents, one stack per branch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suspension_stacks: Vec<SuspensionStack>,
    /// Completed results of a partially-suspended batch, awaiting siblings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_tool_results: Vec<ToolResultPart>,
    /// Lifecycle status.
    pub status: AgentStatus,
    /// When active execution last started; set iff `status == Running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last persistence time.
    pub updated_at: DateTime<Utc>,
    /// Accumulated active execution time from prior resume cycles.
    pub elapsed_execution_ms: u64,
    /// Structured-output correction attempts consumed so far.
    #[serde(default)]
    pub output_validation_retries: u32,
}

impl AgentState {
    /// Create the state for a fresh run.
    #[must_use]
    pub fn new(
        id: RunId,
        root_manifest_id: AgentId,
        manifest_id: AgentId,
        manifest_version: impl Into<String>,
        parent_state_id: Option<RunId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            id,
            root_manifest_id,
            manifest_id,
            manifest_version: manifest_version.into(),
            parent_state_id,
            child_state_ids: Vec::new(),
            messages: Vec::new(),
            steps: Vec::new(),
            current_step_number: 1,
            suspensions: Vec::new(),
            suspension_stacks: Vec::new(),
            pending_tool_results: Vec::new(),
            status: AgentStatus::Running,
            started_at: Some(now),
            created_at: now,
            updated_at: now,
            elapsed_execution_ms: 0,
            output_validation_retries: 0,
        }
    }

    /// Whether any approvals (direct or nested) are pending.
    #[must_use]
    pub fn has_pending_suspensions(&self) -> bool {
        !self.suspensions.is_empty() || !self.suspension_stacks.is_empty()
    }

    /// All approval ids pending on this state, direct and nested.
    #[must_use]
    pub fn all_approval_ids(&self) -> Vec<ApprovalId> {
        self.suspensions
            .iter()
            .map(|s| s.approval_id.clone())
            .chain(
                self.suspension_stacks
                    .iter()
                    .map(|stack| stack.leaf_suspension.approval_id.clone()),
            )
            .collect()
    }

    /// Position of a direct suspension by approval id.
    #[must_use]
    pub fn find_suspension(&self, approval_id: &ApprovalId) -> Option<usize> {
        self.suspensions
            .iter()
            .position(|s| &s.approval_id == approval_id)
    }

    /// Position of a nested stack by its leaf approval id.
    #[must_use]
    pub fn find_stack(&self, approval_id: &ApprovalId) -> Option<usize> {
        self.suspension_stacks
            .iter()
            .position(|stack| &stack.leaf_suspension.approval_id == approval_id)
    }

    /// Transition to a status, maintaining the `started_at` invariant.
    pub fn set_status(&mut self, status: AgentStatus) {
        self.status = status;
        match status {
            AgentStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            AgentStatus::Suspended
            | AgentStatus::Completed
            | AgentStatus::Failed
            | AgentStatus::Cancelled => self.started_at = None,
        }
    }

    /// Tool-call ids of the batch currently awaiting results, in the order
    /// the model issued them. Taken from the most recent assistant message
    /// that requested tool calls.
    #[must_use]
    pub fn pending_batch_order(&self) -> Vec<ToolCallId> {
        self.messages
            .iter()
            .rev()
            .find_map(Message::tool_calls)
            .map(|calls| calls.iter().map(|c| c.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Assemble the batch tool message once every sibling has a result.
    ///
    /// Results are reordered into original tool-call order regardless of
    /// completion order, appended as a single tool message, and the carried
    /// results are cleared. Returns `false` (leaving state untouched) when
    /// results are still missing or approvals are still pending.
    pub fn assemble_pending_tool_message(&mut self) -> bool {
        if self.has_pending_suspensions() || self.pending_tool_results.is_empty() {
            return false;
        }
        let order = self.pending_batch_order();
        if order.is_empty() {
            return false;
        }
        let mut parts = Vec::with_capacity(order.len());
        for call_id in &order {
            match self
                .pending_tool_results
                .iter()
                .find(|part| &part.tool_call_id == call_id)
            {
                Some(part) => parts.push(part.clone()),
                None => return false,
            }
        }
        self.messages.push(Message::tool(parts));
        self.pending_tool_results.clear();
        self.current_step_number += 1;
        true
    }

    /// Verify the structural invariants of this state.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the violated invariant.
    pub fn check_invariants(&self) -> crate::error::Result<()> {
        use crate::error::Error;

        if self.status == AgentStatus::Completed
            && (self.has_pending_suspensions() || !self.pending_tool_results.is_empty())
        {
            return Err(Error::validation(
                "completed state must have no pending suspensions or results",
            ));
        }
        if self.status == AgentStatus::Suspended && !self.has_pending_suspensions() {
            return Err(Error::validation(
                "suspended state must have at least one pending approval",
            ));
        }
        let ids = self.all_approval_ids();
        let unique: std::collections::HashSet<&ApprovalId> = ids.iter().collect();
        if unique.len() != ids.len() {
            return Err(Error::validation("approval ids must be unique within a run"));
        }
        for stack in &self.suspension_stacks {
            let Some(first) = stack.agents.first() else {
                return Err(Error::validation("suspension stack must be non-empty"));
            };
            if first.state_id != self.id {
                return Err(Error::validation(
                    "suspension stack must be rooted at the owning state",
                ));
            }
            let Some(leaf) = stack.leaf() else {
                return Err(Error::validation("suspension stack must be non-empty"));
            };
            if leaf.pending_tool_call_id.is_some() {
                return Err(Error::validation(
                    "leaf stack entry must not have a pending tool call",
                ));
            }
            if stack
                .agents
                .iter()
                .take(stack.agents.len() - 1)
                .any(|entry| entry.pending_tool_call_id.is_none())
            {
                return Err(Error::validation(
                    "non-leaf stack entries must record the invoking tool call",
                ));
            }
        }
        if (self.status == AgentStatus::Running) != self.started_at.is_some() {
            return Err(Error::validation(
                "started_at must be set exactly while running",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_state() -> AgentState {
        AgentState::new(
            RunId::new("run-1"),
            AgentId::new("root"),
            AgentId::new("root"),
            "1.0.0",
            None,
        )
    }

    fn suspension(approval: &str, call: &str) -> ToolApprovalSuspension {
        ToolApprovalSuspension {
            approval_id: ApprovalId::new(approval),
            tool_call_id: ToolCallId::new(call),
            tool_name: "dangerous".to_owned(),
            tool_args: serde_json::json!({}),
            description: None,
        }
    }

    mod status {
        use super::*;

        #[test]
        fn terminal_statuses() {
            assert!(AgentStatus::Completed.is_terminal());
            assert!(AgentStatus::Failed.is_terminal());
            assert!(AgentStatus::Cancelled.is_terminal());
            assert!(!AgentStatus::Running.is_terminal());
            assert!(!AgentStatus::Suspended.is_terminal());
        }

        #[test]
        fn set_status_maintains_started_at() {
            let mut state = base_state();
            assert!(state.started_at.is_some());
            state.set_status(AgentStatus::Suspended);
            assert!(state.started_at.is_none());
            state.set_status(AgentStatus::Running);
            assert!(state.started_at.is_some());
        }
    }

    mod approvals {
        use super::*;

        #[test]
        fn all_approval_ids_spans_direct_and_nested() {
            let mut state = base_state();
            state.suspensions.push(suspension("ap-1", "c1"));
            state.suspension_stacks.push(SuspensionStack {
                agents: vec![
                    SuspensionStackEntry {
                        manifest_id: AgentId::new("root"),
                        state_id: RunId::new("run-1"),
                        pending_tool_call_id: Some(ToolCallId::new("c2")),
                    },
                    SuspensionStackEntry {
                        manifest_id: AgentId::new("child"),
                        state_id: RunId::new("run-2"),
                        pending_tool_call_id: None,
                    },
                ],
                leaf_suspension: suspension("ap-2", "c9"),
            });
            let ids = state.all_approval_ids();
            assert_eq!(ids.len(), 2);
            assert_eq!(state.find_suspension(&ApprovalId::new("ap-1")), Some(0));
            assert_eq!(state.find_stack(&ApprovalId::new("ap-2")), Some(0));
            assert_eq!(state.find_stack(&ApprovalId::new("ap-1")), None);
        }
    }

    mod batch_assembly {
        use super::*;
        use serde_json::Value;

        fn state_with_batch(call_ids: &[&str]) -> AgentState {
            let mut state = base_state();
            let calls: Vec<ToolCallPart> = call_ids
                .iter()
                .map(|id| ToolCallPart::new(ToolCallId::new(*id), format!("tool_{id}"), Value::Null))
                .collect();
            state
                .messages
                .push(Message::assistant_with_tool_calls(None, calls));
            state
        }

        #[test]
        fn reorders_results_into_call_order() {
            let mut state = state_with_batch(&["c1", "c2"]);
            // Completion order is reversed relative to call order.
            state.pending_tool_results.push(ToolResultPart::success(
                ToolCallId::new("c2"),
                "tool_c2",
                serde_json::json!("b"),
            ));
            state.pending_tool_results.push(ToolResultPart::success(
                ToolCallId::new("c1"),
                "tool_c1",
                serde_json::json!("a"),
            ));

            assert!(state.assemble_pending_tool_message());
            assert!(state.pending_tool_results.is_empty());
            let Message::Tool { results } = state.messages.last().unwrap() else {
                panic!("expected a tool message");
            };
            let ids: Vec<&str> = results.iter().map(|r| r.tool_call_id.as_str()).collect();
            assert_eq!(ids, ["c1", "c2"]);
        }

        #[test]
        fn refuses_while_a_sibling_is_missing() {
            let mut state = state_with_batch(&["c1", "c2"]);
            state.pending_tool_results.push(ToolResultPart::success(
                ToolCallId::new("c1"),
                "tool_c1",
                serde_json::json!("a"),
            ));
            assert!(!state.assemble_pending_tool_message());
            assert_eq!(state.pending_tool_results.len(), 1);
        }

        #[test]
        fn refuses_while_suspensions_remain() {
            let mut state = state_with_batch(&["c1"]);
            state.pending_tool_results.push(ToolResultPart::success(
                ToolCallId::new("c1"),
                "tool_c1",
                serde_json::json!("a"),
            ));
            state.suspensions.push(suspension("ap-1", "c1"));
            assert!(!state.assemble_pending_tool_message());
        }

        #[test]
        fn increments_step_number_on_assembly() {
            let mut state = state_with_batch(&["c1"]);
            state.pending_tool_results.push(ToolResultPart::success(
                ToolCallId::new("c1"),
                "tool_c1",
                serde_json::json!("a"),
            ));
            let before = state.current_step_number;
            assert!(state.assemble_pending_tool_message());
            assert_eq!(state.current_step_number, before + 1);
        }
    }

    mod invariants {
        use super::*;
        use serde_json::Value;

        #[test]
        fn fresh_state_is_valid() {
            assert!(base_state().check_invariants().is_ok());
        }

        #[test]
        fn completed_with_pending_results_is_invalid() {
            let mut state = base_state();
            state.set_status(AgentStatus::Completed);
            state.pending_tool_results.push(ToolResultPart::success(
                ToolCallId::new("c1"),
                "t",
                Value::Null,
            ));
            assert!(state.check_invariants().is_err());
        }

        #[test]
        fn suspended_without_approvals_is_invalid() {
            let mut state = base_state();
            state.set_status(AgentStatus::Suspended);
            assert!(state.check_invariants().is_err());
        }

        #[test]
        fn duplicate_approval_ids_are_invalid() {
            let mut state = base_state();
            state.set_status(AgentStatus::Suspended);
            state.suspensions.push(suspension("ap-1", "c1"));
            state.suspensions.push(suspension("ap-1", "c2"));
            assert!(state.check_invariants().is_err());
        }

        #[test]
        fn stack_rooted_elsewhere_is_invalid() {
            let mut state = base_state();
            state.set_status(AgentStatus::Suspended);
            state.suspension_stacks.push(SuspensionStack {
                agents: vec![SuspensionStackEntry {
                    manifest_id: AgentId::new("other"),
                    state_id: RunId::new("someone-else"),
                    pending_tool_call_id: None,
                }],
                leaf_suspension: suspension("ap-1", "c1"),
            });
            assert!(state.check_invariants().is_err());
        }

        #[test]
        fn serde_roundtrip_preserves_state() {
            let mut state = base_state();
            state.messages.push(Message::user("hi"));
            state.suspensions.push(suspension("ap-1", "c1"));
            state.set_status(AgentStatus::Suspended);
            let json = serde_json::to_string(&state).unwrap();
            let parsed: AgentState = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, state);
        }
    }
}
