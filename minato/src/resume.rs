//! Suspension routing and resume.
//!
//! Entry-point inputs are prepared here: fresh requests, replies to
//! completed runs, approval resolutions, and re-drives. The approval path
//! is the heart of durability: an approval id is matched against the
//! state's direct suspensions or against the leaf of one of its suspension
//! stacks, and in the nested case the resolution recurses down the stack
//! one child state at a time.
//!
//! Suspension stacks are the single source of truth for resume routing: a
//! naked approval id only disambiguates within one state, while the stack
//! materializes the whole path from the addressed run to the descendant
//! that needs the decision.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::event::EventPayload;
use crate::id::{AgentId, RunId, ToolCallId};
use crate::manifest::ManifestMap;
use crate::message::{Message, ToolCallPart, ToolResultPart};
use crate::result::{AgentInput, AgentRunResult, ApprovalResponse};
use crate::runner::{RunEnv, build_tools_map, drive};
use crate::state::{
    AgentState, AgentStatus, SuspensionStack, SuspensionStackEntry, ToolApprovalSuspension,
};
use crate::streaming::EventSink;
use crate::tool::{ExecutionContext, SubAgentSuspension, SuspendedTool};

/// Execute one prepared input against a run id. The caller holds the run
/// lock for the duration.
pub(crate) async fn execute(
    env: &Arc<RunEnv>,
    manifests: &ManifestMap,
    run_id: RunId,
    input: AgentInput,
    ctx: &Context,
    sink: &EventSink,
) -> Result<AgentRunResult> {
    match input {
        AgentInput::Request { prompt } => start_fresh(env, manifests, run_id, prompt, ctx, sink).await,
        AgentInput::Reply { message, .. } => reply(env, manifests, run_id, message, ctx, sink).await,
        AgentInput::Approval { response, .. } => {
            resume_approval(env, manifests, &run_id, &response, ctx, sink).await
        }
        AgentInput::Continue { .. } => re_drive(env, manifests, run_id, ctx, sink).await,
    }
}

/// Fresh start: create state, seed the prompt, drive.
async fn start_fresh(
    env: &Arc<RunEnv>,
    manifests: &ManifestMap,
    run_id: RunId,
    prompt: String,
    ctx: &Context,
    sink: &EventSink,
) -> Result<AgentRunResult> {
    let manifest = manifests.root();
    let mut state = AgentState::new(
        run_id,
        manifest.id.clone(),
        manifest.id.clone(),
        manifest.version.clone(),
        None,
    );
    state.messages.push(Message::user(prompt));
    drive(env, manifests, manifest, &mut state, ctx, sink).await
}

/// Reply: a completed run receives a new user turn on the same run id.
async fn reply(
    env: &Arc<RunEnv>,
    manifests: &ManifestMap,
    run_id: RunId,
    message: Message,
    ctx: &Context,
    sink: &EventSink,
) -> Result<AgentRunResult> {
    let mut state = env.store.get(&run_id).await?;
    if state.status != AgentStatus::Completed {
        return Err(Error::bad_request(format!(
            "run {run_id} is {}; replies require a completed run",
            state.status
        ))
        .with_metadata("run_id", run_id.as_str()));
    }
    let manifest = Arc::clone(manifests.require(&state.manifest_id)?);
    state.messages.push(message);
    state.set_status(AgentStatus::Running);
    drive(env, manifests, &manifest, &mut state, ctx, sink).await
}

/// Re-drive a run still marked running (e.g. after a crash). Suspended and
/// terminal runs are rejected.
async fn re_drive(
    env: &Arc<RunEnv>,
    manifests: &ManifestMap,
    run_id: RunId,
    ctx: &Context,
    sink: &EventSink,
) -> Result<AgentRunResult> {
    let mut state = env.store.get(&run_id).await?;
    match state.status {
        AgentStatus::Running => {
            let manifest = Arc::clone(manifests.require(&state.manifest_id)?);
            debug!(run_id = %run_id, "Re-driving run");
            drive(env, manifests, &manifest, &mut state, ctx, sink).await
        }
        AgentStatus::Suspended => Err(Error::bad_request(format!(
            "run {run_id} is suspended; resume it with an approval"
        ))
        .with_metadata("run_id", run_id.as_str())),
        AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Cancelled => {
            Err(Error::bad_request(format!(
                "run {run_id} is {}; nothing to continue",
                state.status
            ))
            .with_metadata("run_id", run_id.as_str()))
        }
    }
}

/// Boxed recursion helper for the delegate case.
fn resume_approval_boxed<'a>(
    env: &'a Arc<RunEnv>,
    manifests: &'a ManifestMap,
    run_id: &'a RunId,
    response: &'a ApprovalResponse,
    ctx: &'a Context,
    sink: &'a EventSink,
) -> BoxFuture<'a, Result<AgentRunResult>> {
    Box::pin(resume_approval(env, manifests, run_id, response, ctx, sink))
}

/// Resolve one approval against a suspended state and continue as far as
/// possible.
pub(crate) async fn resume_approval(
    env: &Arc<RunEnv>,
    manifests: &ManifestMap,
    run_id: &RunId,
    response: &ApprovalResponse,
    ctx: &Context,
    sink: &EventSink,
) -> Result<AgentRunResult> {
    let mut state = env.store.get(run_id).await?;
    if state.status != AgentStatus::Suspended {
        return Err(Error::bad_request(format!(
            "run {run_id} is {}; approvals require a suspended run",
            state.status
        ))
        .with_metadata("run_id", run_id.as_str()));
    }

    if let Some(position) = state.find_suspension(&response.approval_id) {
        let suspension = state.suspensions.remove(position);
        resolve_direct(env, manifests, &mut state, suspension, response, ctx, sink).await?;
        return settle(env, manifests, state, ctx, sink).await;
    }

    if let Some(position) = state.find_stack(&response.approval_id) {
        let stack = state.suspension_stacks.remove(position);
        resolve_delegated(env, manifests, &mut state, stack, response, ctx, sink).await?;
        return settle(env, manifests, state, ctx, sink).await;
    }

    Err(Error::bad_request(format!(
        "approval {} is not pending on run {run_id}",
        response.approval_id
    ))
    .with_metadata("run_id", run_id.as_str())
    .with_metadata("approval_id", response.approval_id.as_str()))
}

/// Direct case: this state owns the suspension. An approved call executes
/// now with a grant; a denied call yields an error result part so the model
/// can react.
async fn resolve_direct(
    env: &Arc<RunEnv>,
    manifests: &ManifestMap,
    state: &mut AgentState,
    suspension: ToolApprovalSuspension,
    response: &ApprovalResponse,
    ctx: &Context,
    sink: &EventSink,
) -> Result<()> {
    let call = ToolCallPart::new(
        suspension.tool_call_id.clone(),
        suspension.tool_name.clone(),
        suspension.tool_args.clone(),
    );

    if !response.approved {
        info!(approval_id = %suspension.approval_id, tool = %suspension.tool_name, "Approval denied");
        let message = match &response.reason {
            Some(reason) => format!("Tool execution denied: {reason}"),
            None => "Tool execution denied".to_owned(),
        };
        push_result_part(
            state,
            sink,
            ToolResultPart::error(call.id, suspension.tool_name, message),
        )
        .await;
        return Ok(());
    }

    info!(approval_id = %suspension.approval_id, tool = %suspension.tool_name, "Approval granted");
    let manifest = manifests.require(&state.manifest_id)?;
    let tools_map = build_tools_map(env, manifests, manifest, state);
    let Some(tool) = tools_map.get(&suspension.tool_name) else {
        push_result_part(
            state,
            sink,
            ToolResultPart::error(
                call.id,
                suspension.tool_name.clone(),
                format!("Unknown tool: {}", suspension.tool_name),
            ),
        )
        .await;
        return Ok(());
    };

    let exec_ctx = ExecutionContext::new(
        ctx.clone(),
        state.messages.clone(),
        state.current_step_number,
    )
    .with_grants([call.id.clone()].into_iter().collect());
    let outcome = env.harness.execute(tool, &call, &exec_ctx, sink).await;
    for child in exec_ctx.take_children() {
        if !state.child_state_ids.contains(&child) {
            state.child_state_ids.push(child);
        }
    }

    match outcome {
        crate::tool::ToolOutcome::Suspended(SuspendedTool::Approval(new_suspension)) => {
            state.suspensions.push(new_suspension);
        }
        crate::tool::ToolOutcome::Suspended(SuspendedTool::SubAgent(sub)) => {
            let stacks = reroot_stacks(&state.manifest_id, &state.id, &call.id, &sub);
            state.suspension_stacks.extend(stacks);
        }
        completed => {
            if let Some(part) = completed.into_result_part(&call) {
                push_result_part(state, sink, part).await;
            }
        }
    }
    Ok(())
}

/// Delegate case: the approval lives in a descendant. Recurse down one
/// level, then fold the child's outcome back into this state.
async fn resolve_delegated(
    env: &Arc<RunEnv>,
    manifests: &ManifestMap,
    state: &mut AgentState,
    stack: SuspensionStack,
    response: &ApprovalResponse,
    ctx: &Context,
    sink: &EventSink,
) -> Result<()> {
    let Some(parent_entry) = stack.agents.first() else {
        return Err(Error::internal("suspension stack is empty")
            .with_metadata("run_id", state.id.as_str()));
    };
    let Some(pending_call_id) = parent_entry.pending_tool_call_id.clone() else {
        return Err(Error::internal(
            "delegated suspension stack lacks the invoking tool call",
        )
        .with_metadata("run_id", state.id.as_str()));
    };
    let Some(child_entry) = stack.agents.get(1) else {
        return Err(Error::internal("suspension stack has no child hop")
            .with_metadata("run_id", state.id.as_str()));
    };

    let child_manifest = Arc::clone(manifests.require(&child_entry.manifest_id)?);
    let child_sink = sink.child(
        child_manifest.id.clone(),
        child_manifest.streaming_events.clone(),
    );
    let child_ctx = ctx.child();
    debug!(
        child_run_id = %child_entry.state_id,
        approval_id = %response.approval_id,
        "Routing approval to descendant"
    );
    let child_result = resume_approval_boxed(
        env,
        manifests,
        &child_entry.state_id,
        response,
        &child_ctx,
        &child_sink,
    )
    .await?;

    let tool_name = manifests
        .require(&state.manifest_id)?
        .sub_agent_by_id(&child_entry.manifest_id)
        .map_or_else(
            || format!("sub_agent_{}", child_entry.manifest_id),
            |reference| reference.name.clone(),
        );

    match child_result {
        AgentRunResult::Suspended {
            run_id: child_run_id,
            suspensions,
            suspension_stacks,
        } => {
            // The child suspended again: replace the old stack with the
            // re-rooted successors.
            let sub = SubAgentSuspension {
                state_id: child_run_id,
                manifest_id: child_entry.manifest_id.clone(),
                suspensions,
                suspension_stacks,
            };
            let stacks = reroot_stacks(&state.manifest_id, &state.id, &pending_call_id, &sub);
            state.suspension_stacks.extend(stacks);
        }
        AgentRunResult::Complete { output, .. } => {
            push_result_part(
                state,
                sink,
                ToolResultPart::success(pending_call_id, tool_name, output),
            )
            .await;
        }
        AgentRunResult::Error { error, .. } => {
            push_result_part(
                state,
                sink,
                ToolResultPart::error(
                    pending_call_id,
                    tool_name.clone(),
                    format!("Sub-agent '{tool_name}' failed: {}", error.message),
                ),
            )
            .await;
        }
        AgentRunResult::Cancelled { .. } => {
            push_result_part(
                state,
                sink,
                ToolResultPart::error(
                    pending_call_id,
                    tool_name.clone(),
                    format!("Sub-agent '{tool_name}' was cancelled"),
                ),
            )
            .await;
        }
    }
    Ok(())
}

/// After one resolution: stay suspended if approvals remain, otherwise
/// assemble the batch tool message and continue the loop.
async fn settle(
    env: &Arc<RunEnv>,
    manifests: &ManifestMap,
    mut state: AgentState,
    ctx: &Context,
    sink: &EventSink,
) -> Result<AgentRunResult> {
    if state.has_pending_suspensions() {
        state.set_status(AgentStatus::Suspended);
        env.store.set(&mut state).await?;
        debug!(
            run_id = %state.id,
            remaining = state.suspensions.len() + state.suspension_stacks.len(),
            "Partial resume; approvals still pending"
        );
        return Ok(AgentRunResult::Suspended {
            run_id: state.id.clone(),
            suspensions: state.suspensions.clone(),
            suspension_stacks: state.suspension_stacks.clone(),
        });
    }

    if !state.assemble_pending_tool_message() {
        return Err(Error::internal(
            "all approvals resolved but the tool batch could not be assembled",
        )
        .with_metadata("run_id", state.id.as_str()));
    }

    let manifest = Arc::clone(manifests.require(&state.manifest_id)?);
    state.set_status(AgentStatus::Running);
    env.store.set(&mut state).await?;
    drive(env, manifests, &manifest, &mut state, ctx, sink).await
}

async fn push_result_part(state: &mut AgentState, sink: &EventSink, part: ToolResultPart) {
    sink.emit(EventPayload::ToolResult {
        result: part.clone(),
    })
    .await;
    state.pending_tool_results.push(part);
}

/// Root a suspended child's pending approvals at the parent.
///
/// Direct suspensions of the child become depth-2 stacks; the child's own
/// stacks are prepended with the parent hop. The parent hop records the
/// tool call that invoked the child so the batch can be reconstituted when
/// the branch completes.
pub(crate) fn reroot_stacks(
    parent_manifest_id: &AgentId,
    parent_run_id: &RunId,
    pending_tool_call_id: &ToolCallId,
    suspension: &SubAgentSuspension,
) -> Vec<SuspensionStack> {
    let parent_entry = SuspensionStackEntry {
        manifest_id: parent_manifest_id.clone(),
        state_id: parent_run_id.clone(),
        pending_tool_call_id: Some(pending_tool_call_id.clone()),
    };
    let mut stacks = Vec::with_capacity(
        suspension.suspensions.len() + suspension.suspension_stacks.len(),
    );
    for leaf in &suspension.suspensions {
        stacks.push(SuspensionStack {
            agents: vec![
                parent_entry.clone(),
                SuspensionStackEntry {
                    manifest_id: suspension.manifest_id.clone(),
                    state_id: suspension.state_id.clone(),
                    pending_tool_call_id: None,
                },
            ],
            leaf_suspension: leaf.clone(),
        });
    }
    for child_stack in &suspension.suspension_stacks {
        let mut agents = Vec::with_capacity(child_stack.agents.len() + 1);
        agents.push(parent_entry.clone());
        agents.extend(child_stack.agents.iter().cloned());
        stacks.push(SuspensionStack {
            agents,
            leaf_suspension: child_stack.leaf_suspension.clone(),
        });
    }
    stacks
}
