//! The per-run execution loop.
//!
//! [`drive`] takes a prepared [`AgentState`] and iterates LLM steps until a
//! terminal outcome: a final answer, a suspension, a failure, a timeout, or
//! a cancellation. Each step streams parts from the provider (forwarding
//! them as events), classifies the response, fans out tool calls through
//! the dispatcher, and persists the state.
//!
//! Sub-agent invocation is a synthesized streaming-context tool whose
//! execution is a nested `drive` over a fresh child state. The recursion is
//! broken at the tool-trait object boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt as _;
use serde_json::Value;
use tracing::{Instrument as _, debug, error, info, info_span};

use crate::cancel::CancellationChannel;
use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::dispatcher::dispatch_tool_calls;
use crate::error::{Error, Result};
use crate::event::EventPayload;
use crate::harness::ToolHarness;
use crate::hook::{NoopRunHooks, RunHooks};
use crate::id::{AgentId, RunId};
use crate::manifest::{AgentManifest, ManifestMap};
use crate::message::{Message, ToolCallPart};
use crate::provider::{FinishReason, PartAggregator, StepRequest, StreamPart};
use crate::result::AgentRunResult;
use crate::state::{AgentState, AgentStatus, StepRecord};
use crate::store::StateStore;
use crate::streaming::EventSink;
use crate::tool::{
    ExecutionContext, SubAgentSuspension, SuspendedTool, Tool, ToolDefinition, ToolOutcome,
    outcome_code,
};
use crate::usage::Usage;

/// Shared handles every run needs; owned by the service, borrowed by the
/// loop, and cloned into synthesized sub-agent tools.
pub(crate) struct RunEnv {
    pub config: RuntimeConfig,
    pub store: StateStore,
    pub cancellation: CancellationChannel,
    pub harness: ToolHarness,
}

impl std::fmt::Debug for RunEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEnv").finish_non_exhaustive()
    }
}

/// Outcome classification of one step, after tool dispatch.
enum StepFlow {
    /// Continue with the next step.
    Continue,
    /// The run reached a terminal (or durably paused) outcome.
    Done(AgentRunResult),
}

/// Drive a prepared state to a terminal outcome.
///
/// The state must be `Running` with its messages ready for the next step.
/// Every exit path persists the state before returning.
pub(crate) async fn drive(
    env: &Arc<RunEnv>,
    manifests: &ManifestMap,
    manifest: &Arc<AgentManifest>,
    state: &mut AgentState,
    ctx: &Context,
    sink: &EventSink,
) -> Result<AgentRunResult> {
    let span = info_span!(
        "agent",
        agent.manifest_id = %manifest.id,
        agent.run_id = %state.id,
        agent.model = %manifest.provider.model_id(),
    );
    drive_inner(env, manifests, manifest, state, ctx, sink)
        .instrument(span)
        .await
}

async fn drive_inner(
    env: &Arc<RunEnv>,
    manifests: &ManifestMap,
    manifest: &Arc<AgentManifest>,
    state: &mut AgentState,
    ctx: &Context,
    sink: &EventSink,
) -> Result<AgentRunResult> {
    let noop = NoopRunHooks;
    let hooks: &dyn RunHooks = manifest.hooks.as_deref().unwrap_or(&noop);
    let timeout_ms = u64::try_from(manifest.effective_timeout(&env.config).as_millis())
        .unwrap_or(u64::MAX);
    let start = Instant::now();
    let tools_map = build_tools_map(env, manifests, manifest, state);

    hooks.agent_start(ctx, &manifest.name).await;
    // Persist before the first step so out-of-band readers (status, cancel)
    // see the run immediately; updated_at doubles as the heartbeat.
    env.store.set(state).await?;
    sink.emit(EventPayload::AgentStarted {
        run_id: state.id.clone(),
    })
    .await;

    // Background watcher trips the run's token when an out-of-band signal
    // lands mid-step.
    let _watch = env
        .cancellation
        .watch(state.id.clone(), ctx.cancellation_token().clone());

    loop {
        let active_ms = state
            .elapsed_execution_ms
            .saturating_add(u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX));
        if active_ms > timeout_ms {
            let err = Error::timeout(format!(
                "active execution exceeded {timeout_ms} ms budget"
            ))
            .with_metadata("run_id", state.id.as_str());
            return finish_failed(env, state, ctx, sink, hooks, &manifest.name, start, err).await;
        }

        if ctx.is_cancelled() || env.cancellation.peek(&state.id).await?.is_some() {
            return finish_cancelled(env, state, ctx, sink, hooks, &manifest.name, start).await;
        }

        debug!(step = state.current_step_number, "Starting step");
        sink.emit(EventPayload::StepStart {
            step: state.current_step_number,
        })
        .await;

        let request = build_step_request(manifest, &state.messages);
        let response = match stream_step(manifest, request, ctx, sink).await {
            Ok(Some(response)) => response,
            // Cancellation observed while the stream was in flight.
            Ok(None) => {
                return finish_cancelled(env, state, ctx, sink, hooks, &manifest.name, start)
                    .await;
            }
            Err(err) => {
                error!(error = %err, step = state.current_step_number, "LLM step failed");
                return finish_failed(env, state, ctx, sink, hooks, &manifest.name, start, err)
                    .await;
            }
        };

        state.steps.push(StepRecord {
            step: state.current_step_number,
            model: manifest.provider.model_id().to_owned(),
            text: response.text.clone(),
            tool_calls: response.tool_calls.clone(),
            finish_reason: response.finish_reason,
            usage: response.usage,
        });
        state.messages.push(Message::assistant_with_tool_calls(
            response.text.clone(),
            response.tool_calls.clone(),
        ));
        sink.emit(EventPayload::StepFinish {
            step: state.current_step_number,
            finish_reason: response.finish_reason,
        })
        .await;

        let flow = if response.tool_calls.is_empty() {
            if response.finish_reason == FinishReason::Error {
                let err = Error::internal("model reported an error finish")
                    .with_metadata("run_id", state.id.as_str());
                return finish_failed(env, state, ctx, sink, hooks, &manifest.name, start, err)
                    .await;
            }
            final_step(env, manifest, state, ctx, sink, hooks, start, &response).await?
        } else {
            tool_step(
                env,
                manifest,
                state,
                ctx,
                sink,
                hooks,
                start,
                &tools_map,
                &response.tool_calls,
            )
            .await?
        };

        match flow {
            StepFlow::Done(result) => return Ok(result),
            StepFlow::Continue => {
                env.store.set(state).await?;
            }
        }
    }
}

/// Consume one provider stream, forwarding events. Returns `None` when
/// cancellation was observed mid-stream.
async fn stream_step(
    manifest: &AgentManifest,
    request: StepRequest,
    ctx: &Context,
    sink: &EventSink,
) -> Result<Option<crate::provider::StepResponse>> {
    let mut parts = manifest.provider.stream(request).await?;
    let mut aggregator = PartAggregator::new();
    while let Some(part) = parts.next().await {
        if ctx.is_cancelled() {
            return Ok(None);
        }
        let part = part?;
        match &part {
            StreamPart::TextDelta { delta } => {
                sink.emit(EventPayload::TextDelta {
                    delta: delta.clone(),
                })
                .await;
            }
            StreamPart::ReasoningDelta { delta } => {
                sink.emit(EventPayload::ReasoningDelta {
                    delta: delta.clone(),
                })
                .await;
            }
            StreamPart::ToolInputStart { id, name } => {
                sink.emit(EventPayload::ToolInputStart {
                    id: id.clone(),
                    name: name.clone(),
                })
                .await;
            }
            StreamPart::ToolInputDelta { id, delta } => {
                sink.emit(EventPayload::ToolInputDelta {
                    id: id.clone(),
                    delta: delta.clone(),
                })
                .await;
            }
            StreamPart::ToolCall(call) => {
                sink.emit(EventPayload::ToolCall { call: call.clone() }).await;
            }
            StreamPart::ToolResult(result) => {
                sink.emit(EventPayload::ToolResult {
                    result: result.clone(),
                })
                .await;
            }
            StreamPart::Start
            | StreamPart::StartStep
            | StreamPart::FinishStep { .. }
            | StreamPart::Finish { .. } => {}
        }
        aggregator.apply(&part);
    }
    Ok(Some(aggregator.into_response()))
}

/// Handle a step that ended without tool calls.
#[allow(clippy::too_many_arguments)]
async fn final_step(
    env: &Arc<RunEnv>,
    manifest: &AgentManifest,
    state: &mut AgentState,
    ctx: &Context,
    sink: &EventSink,
    hooks: &dyn RunHooks,
    start: Instant,
    response: &crate::provider::StepResponse,
) -> Result<StepFlow> {
    let text = response.text.clone().unwrap_or_default();
    match validate_output(manifest.output_schema.as_ref(), &text) {
        Ok(output) => {
            accumulate_elapsed(state, start);
            state.set_status(AgentStatus::Completed);
            env.store.set(state).await?;
            sink.emit(EventPayload::AgentDone {
                run_id: state.id.clone(),
            })
            .await;
            hooks.agent_end(ctx, &manifest.name, AgentStatus::Completed.as_str()).await;
            info!(steps = state.steps.len(), "Agent run completed");
            Ok(StepFlow::Done(AgentRunResult::Complete {
                run_id: state.id.clone(),
                output,
                text: response.text.clone(),
                usage: total_usage(state),
            }))
        }
        Err(problem) => {
            state.output_validation_retries += 1;
            if state.output_validation_retries > env.config.output_validation_max_retries {
                let err = Error::validation(format!(
                    "output failed schema validation after {} attempts: {problem}",
                    state.output_validation_retries
                ))
                .with_metadata("run_id", state.id.as_str());
                let result =
                    finish_failed(env, state, ctx, sink, hooks, &manifest.name, start, err)
                        .await?;
                return Ok(StepFlow::Done(result));
            }
            debug!(retry = state.output_validation_retries, "Output validation failed; re-prompting");
            state.messages.push(Message::user(format!(
                "Your previous reply did not match the required output format: {problem}. \
                 Reply again, following the schema exactly."
            )));
            state.current_step_number += 1;
            Ok(StepFlow::Continue)
        }
    }
}

/// Handle a step that requested tool calls.
#[allow(clippy::too_many_arguments)]
async fn tool_step(
    env: &Arc<RunEnv>,
    manifest: &AgentManifest,
    state: &mut AgentState,
    ctx: &Context,
    sink: &EventSink,
    hooks: &dyn RunHooks,
    start: Instant,
    tools_map: &HashMap<String, Tool>,
    calls: &[ToolCallPart],
) -> Result<StepFlow> {
    let exec_ctx = ExecutionContext::new(
        ctx.clone(),
        state.messages.clone(),
        state.current_step_number,
    );
    for call in calls {
        hooks.tool_start(ctx, &call.name).await;
    }
    let dispatch = dispatch_tool_calls(calls, tools_map, &env.harness, &exec_ctx, sink).await;
    for part in &dispatch.parts {
        let outcome = if part.is_error { "error" } else { "success" };
        hooks.tool_end(ctx, &part.tool_name, outcome).await;
    }
    for child in exec_ctx.take_children() {
        if !state.child_state_ids.contains(&child) {
            state.child_state_ids.push(child);
        }
    }

    if dispatch.is_suspended() {
        state.suspensions.extend(dispatch.suspensions);
        for (call_id, suspension) in dispatch.sub_agent_suspensions {
            let stacks = crate::resume::reroot_stacks(
                &state.manifest_id,
                &state.id,
                &call_id,
                &suspension,
            );
            state.suspension_stacks.extend(stacks);
        }
        state.pending_tool_results.extend(dispatch.parts);
        accumulate_elapsed(state, start);
        state.set_status(AgentStatus::Suspended);
        env.store.set(state).await?;
        sink.emit(EventPayload::AgentSuspended {
            run_id: state.id.clone(),
            approval_ids: state.all_approval_ids(),
        })
        .await;
        hooks
            .agent_end(ctx, &manifest.name, AgentStatus::Suspended.as_str())
            .await;
        info!(
            approvals = state.suspensions.len(),
            stacks = state.suspension_stacks.len(),
            "Agent run suspended"
        );
        return Ok(StepFlow::Done(AgentRunResult::Suspended {
            run_id: state.id.clone(),
            suspensions: state.suspensions.clone(),
            suspension_stacks: state.suspension_stacks.clone(),
        }));
    }

    state.messages.push(Message::tool(dispatch.parts));
    state.current_step_number += 1;
    Ok(StepFlow::Continue)
}

#[allow(clippy::too_many_arguments)]
async fn finish_failed(
    env: &Arc<RunEnv>,
    state: &mut AgentState,
    ctx: &Context,
    sink: &EventSink,
    hooks: &dyn RunHooks,
    agent_name: &str,
    start: Instant,
    err: Error,
) -> Result<AgentRunResult> {
    accumulate_elapsed(state, start);
    state.set_status(AgentStatus::Failed);
    env.store.set(state).await?;
    let detail = err.detail();
    sink.emit(EventPayload::AgentError {
        run_id: state.id.clone(),
        error: detail.clone(),
    })
    .await;
    hooks
        .agent_end(ctx, agent_name, AgentStatus::Failed.as_str())
        .await;
    Ok(AgentRunResult::Error {
        run_id: state.id.clone(),
        error: detail,
    })
}

async fn finish_cancelled(
    env: &Arc<RunEnv>,
    state: &mut AgentState,
    ctx: &Context,
    sink: &EventSink,
    hooks: &dyn RunHooks,
    agent_name: &str,
    start: Instant,
) -> Result<AgentRunResult> {
    sink.emit(EventPayload::AgentCancelling {
        run_id: state.id.clone(),
    })
    .await;
    accumulate_elapsed(state, start);
    state.set_status(AgentStatus::Cancelled);
    env.store.set(state).await?;
    sink.emit(EventPayload::AgentCancelled {
        run_id: state.id.clone(),
    })
    .await;
    hooks
        .agent_end(ctx, agent_name, AgentStatus::Cancelled.as_str())
        .await;
    info!("Agent run cancelled");
    Ok(AgentRunResult::Cancelled {
        run_id: state.id.clone(),
    })
}

fn accumulate_elapsed(state: &mut AgentState, start: Instant) {
    state.elapsed_execution_ms = state
        .elapsed_execution_ms
        .saturating_add(u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX));
}

/// Sum usage across every recorded step.
fn total_usage(state: &AgentState) -> Usage {
    state
        .steps
        .iter()
        .fold(Usage::zero(), |acc, step| acc + step.usage)
}

/// Build the provider request for the next step.
fn build_step_request(manifest: &AgentManifest, messages: &[Message]) -> StepRequest {
    let mut definitions: Vec<ToolDefinition> = manifest
        .tools
        .iter()
        .map(|tool| tool.definition().clone())
        .collect();
    definitions.extend(manifest.sub_agents.iter().map(sub_agent_definition));
    StepRequest {
        system: (!manifest.instructions.is_empty()).then(|| manifest.instructions.clone()),
        messages: messages.to_vec(),
        tools: definitions,
        output_schema: manifest.output_schema.clone(),
    }
}

/// Tool definition synthesized for a sub-agent reference.
fn sub_agent_definition(reference: &crate::manifest::SubAgentRef) -> ToolDefinition {
    ToolDefinition::new(
        reference.name.clone(),
        format!(
            "Delegate a task to the '{}' sub-agent. {}",
            reference.manifest_id, reference.description
        ),
        serde_json::json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The task for the sub-agent"
                }
            },
            "required": ["prompt"]
        }),
    )
}

/// Build the executable tool map for one run: the manifest's own tools plus
/// a synthesized streaming-context tool per sub-agent reference.
pub(crate) fn build_tools_map(
    env: &Arc<RunEnv>,
    manifests: &ManifestMap,
    manifest: &AgentManifest,
    state: &AgentState,
) -> HashMap<String, Tool> {
    let mut map: HashMap<String, Tool> = manifest
        .tools
        .iter()
        .map(|tool| (tool.name().to_owned(), tool.clone()))
        .collect();
    for reference in &manifest.sub_agents {
        let tool = Tool::streaming(
            sub_agent_definition(reference),
            Arc::new(SubAgentTool {
                env: Arc::clone(env),
                manifests: manifests.clone(),
                child_manifest_id: reference.manifest_id.clone(),
                parent_run_id: state.id.clone(),
                root_manifest_id: state.root_manifest_id.clone(),
                name: reference.name.clone(),
            }),
        );
        map.insert(reference.name.clone(), tool);
    }
    map
}

/// Synthesized tool that runs a sub-agent as a nested run.
struct SubAgentTool {
    env: Arc<RunEnv>,
    manifests: ManifestMap,
    child_manifest_id: AgentId,
    parent_run_id: RunId,
    root_manifest_id: AgentId,
    name: String,
}

#[async_trait]
impl crate::tool::StreamingContextTool for SubAgentTool {
    async fn execute(
        &self,
        call: &ToolCallPart,
        ctx: &ExecutionContext,
        sink: &EventSink,
    ) -> ToolOutcome {
        let manifest = match self.manifests.require(&self.child_manifest_id) {
            Ok(manifest) => Arc::clone(manifest),
            Err(err) => {
                return ToolOutcome::error(err.to_string(), outcome_code::EXECUTION_ERROR);
            }
        };
        let prompt = call
            .arguments
            .get("prompt")
            .and_then(Value::as_str)
            .map_or_else(|| call.arguments.to_string(), str::to_owned);

        sink.emit(EventPayload::SubAgentStart {
            name: self.name.clone(),
            manifest_id: self.child_manifest_id.clone(),
        })
        .await;

        let child_run_id = RunId::generate();
        ctx.record_child(child_run_id.clone());
        let mut child_state = AgentState::new(
            child_run_id,
            self.root_manifest_id.clone(),
            manifest.id.clone(),
            manifest.version.clone(),
            Some(self.parent_run_id.clone()),
        );
        child_state.messages.push(Message::user(prompt));

        let child_ctx = ctx.context.child();
        let child_sink = sink.child(manifest.id.clone(), manifest.streaming_events.clone());
        let result = drive(
            &self.env,
            &self.manifests,
            &manifest,
            &mut child_state,
            &child_ctx,
            &child_sink,
        )
        .await;

        let status = match &result {
            Ok(run_result) => run_result.status().to_owned(),
            Err(_) => "error".to_owned(),
        };
        sink.emit(EventPayload::SubAgentEnd {
            name: self.name.clone(),
            manifest_id: self.child_manifest_id.clone(),
            status,
        })
        .await;

        match result {
            Ok(AgentRunResult::Complete { output, .. }) => ToolOutcome::Success(output),
            Ok(AgentRunResult::Suspended {
                run_id,
                suspensions,
                suspension_stacks,
            }) => ToolOutcome::Suspended(SuspendedTool::SubAgent(SubAgentSuspension {
                state_id: run_id,
                manifest_id: self.child_manifest_id.clone(),
                suspensions,
                suspension_stacks,
            })),
            Ok(AgentRunResult::Error { error, .. }) => ToolOutcome::error(
                format!("Sub-agent '{}' failed: {}", self.name, error.message),
                outcome_code::SUB_AGENT_FAILED,
            ),
            Ok(AgentRunResult::Cancelled { .. }) => ToolOutcome::error(
                format!("Sub-agent '{}' was cancelled", self.name),
                outcome_code::CANCELLED,
            ),
            Err(err) => ToolOutcome::error(err.to_string(), outcome_code::EXECUTION_ERROR),
        }
    }
}

/// Validate final text against the manifest's output schema.
///
/// Without a schema, the text itself is the output. With one, the text must
/// parse as JSON and structurally satisfy the schema; the error string is a
/// correction hint for the re-prompt.
fn validate_output(
    schema: Option<&Value>,
    text: &str,
) -> std::result::Result<Value, String> {
    let Some(schema) = schema else {
        return Ok(Value::String(text.to_owned()));
    };
    let value: Value = serde_json::from_str(text)
        .map_err(|_| "the reply is not valid JSON".to_owned())?;
    check_schema(schema, &value, "$")?;
    Ok(value)
}

/// Minimal structural JSON-schema check: type tags and required properties,
/// recursively.
fn check_schema(schema: &Value, value: &Value, path: &str) -> std::result::Result<(), String> {
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        let matches = match expected {
            "object" => value.is_object(),
            "array" => value.is_array(),
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "null" => value.is_null(),
            _ => true,
        };
        if !matches {
            return Err(format!("{path} must be of type {expected}"));
        }
    }
    if let (Some(required), Some(object)) = (
        schema.get("required").and_then(Value::as_array),
        value.as_object(),
    ) {
        for key in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(key) {
                return Err(format!("{path} is missing required property '{key}'"));
            }
        }
    }
    if let (Some(properties), Some(object)) = (
        schema.get("properties").and_then(Value::as_object),
        value.as_object(),
    ) {
        for (key, sub_schema) in properties {
            if let Some(sub_value) = object.get(key) {
                check_schema(sub_schema, sub_value, &format!("{path}.{key}"))?;
            }
        }
    }
    if let (Some(item_schema), Some(items)) = (schema.get("items"), value.as_array()) {
        for (index, item) in items.iter().enumerate() {
            check_schema(item_schema, item, &format!("{path}[{index}]"))?;
        }
    }
    Ok(())
}
