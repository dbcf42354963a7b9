//! Parallel tool dispatch for one step.
//!
//! All tool calls produced by one LLM step are fanned out concurrently and
//! every individual outcome is classified: unknown tool, completed (success
//! or bounded error), or suspended. Results are kept in the original
//! tool-call order regardless of completion order.
//!
//! If any call suspends, the whole step suspends; completed siblings are
//! carried so the batch's tool message can be assembled once the last
//! suspension resolves.

use std::collections::HashMap;

use futures::future::join_all;
use tracing::warn;

use crate::event::EventPayload;
use crate::harness::ToolHarness;
use crate::id::ToolCallId;
use crate::message::{ToolCallPart, ToolResultPart};
use crate::state::ToolApprovalSuspension;
use crate::streaming::EventSink;
use crate::tool::{
    ExecutionContext, SubAgentSuspension, SuspendedTool, Tool, ToolOutcome, outcome_code,
};

/// Classified results of one dispatched batch.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Completed results (successes, bounded errors, unknown tools), in
    /// original tool-call order.
    pub parts: Vec<ToolResultPart>,
    /// Calls suspended awaiting direct approval.
    pub suspensions: Vec<ToolApprovalSuspension>,
    /// Calls whose sub-agent run suspended, keyed by the invoking call.
    pub sub_agent_suspensions: Vec<(ToolCallId, SubAgentSuspension)>,
}

impl DispatchOutcome {
    /// Whether any call in the batch suspended.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        !self.suspensions.is_empty() || !self.sub_agent_suspensions.is_empty()
    }
}

/// Fan out all tool calls of one step and classify each outcome.
pub async fn dispatch_tool_calls(
    calls: &[ToolCallPart],
    tools: &HashMap<String, Tool>,
    harness: &ToolHarness,
    ctx: &ExecutionContext,
    sink: &EventSink,
) -> DispatchOutcome {
    let futures = calls.iter().map(|call| async move {
        match tools.get(&call.name) {
            None => {
                warn!(tool = %call.name, "Unknown tool requested");
                ToolOutcome::error(
                    format!("Unknown tool: {}", call.name),
                    outcome_code::UNKNOWN_TOOL,
                )
            }
            Some(tool) => harness.execute(tool, call, ctx, sink).await,
        }
    });
    let outcomes = join_all(futures).await;

    let mut result = DispatchOutcome::default();
    for (call, outcome) in calls.iter().zip(outcomes) {
        match outcome {
            ToolOutcome::Suspended(SuspendedTool::Approval(suspension)) => {
                result.suspensions.push(suspension);
            }
            ToolOutcome::Suspended(SuspendedTool::SubAgent(suspension)) => {
                result
                    .sub_agent_suspensions
                    .push((call.id.clone(), suspension));
            }
            completed @ (ToolOutcome::Success(_) | ToolOutcome::Error { .. }) => {
                if let Some(part) = completed.into_result_part(call) {
                    sink.emit(EventPayload::ToolResult {
                        result: part.clone(),
                    })
                    .await;
                    result.parts.push(part);
                }
            }
        }
    }
    result
}
