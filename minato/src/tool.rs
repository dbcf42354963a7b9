//! Tools callable by agents.
//!
//! A [`Tool`] is a tagged union over three executor shapes:
//!
//! - **Plain** — a pure capability taking JSON input and the message
//!   history; any error is bounded to the call.
//! - **Context** — receives the full [`ExecutionContext`] (cancellation,
//!   message history, approval grants) and produces a [`ToolOutcome`]
//!   directly, including suspensions.
//! - **Streaming context** — like context, but additionally handed an event
//!   sink; used for sub-agent invocation so child events reach the
//!   consumer while the tool runs.
//!
//! The harness dispatches on the shape tag; tools are never composed via
//! inheritance.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Context;
use crate::error::Result;
use crate::harness::ToolMiddleware;
use crate::id::{AgentId, RunId, ToolCallId};
use crate::message::{Message, ToolCallPart, ToolResultPart};
use crate::state::{SuspensionStack, ToolApprovalSuspension};
use crate::streaming::EventSink;

/// Stable outcome codes for tool errors.
pub mod outcome_code {
    /// The tool itself failed.
    pub const EXECUTION_ERROR: &str = "ExecutionError";
    /// The invocation was cancelled before or during execution.
    pub const CANCELLED: &str = "Cancelled";
    /// The invocation exceeded its per-call timeout.
    pub const TIMEOUT: &str = "Timeout";
    /// The requested tool does not exist.
    pub const UNKNOWN_TOOL: &str = "UnknownTool";
    /// A human denied the approval for this call.
    pub const APPROVAL_DENIED: &str = "ApprovalDenied";
    /// A sub-agent run ended in failure.
    pub const SUB_AGENT_FAILED: &str = "SubAgentFailed";
}

/// Declarative description of a tool for LLM function calling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name, snake_case.
    pub name: String,
    /// What the tool does; guides the model's choice.
    pub description: String,
    /// JSON schema of the tool's parameters.
    pub parameters: Value,
}

impl ToolDefinition {
    /// Create a definition from explicit parts.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Create a definition whose parameter schema is derived from a type.
    #[must_use]
    pub fn for_type<T: JsonSchema>(
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let schema = schemars::schema_for!(T);
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::to_value(schema).unwrap_or(Value::Null),
        }
    }
}

/// The result of executing one tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    /// The tool produced a value.
    Success(Value),
    /// The tool failed; the error is bounded to this call.
    Error {
        /// Human-readable message.
        message: String,
        /// Stable code from [`outcome_code`].
        code: String,
        /// Whether a retry could help.
        retryable: bool,
    },
    /// The call is paused awaiting out-of-band approval.
    Suspended(SuspendedTool),
}

impl ToolOutcome {
    /// A non-retryable error outcome.
    #[must_use]
    pub fn error(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: code.into(),
            retryable: false,
        }
    }

    /// A retryable error outcome.
    #[must_use]
    pub fn retryable_error(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: code.into(),
            retryable: true,
        }
    }

    /// Whether this outcome suspends the call.
    #[must_use]
    pub const fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended(_))
    }

    /// Convert a completed outcome into a result part for the tool message.
    /// Returns `None` for suspensions.
    #[must_use]
    pub fn into_result_part(self, call: &ToolCallPart) -> Option<ToolResultPart> {
        match self {
            Self::Success(output) => Some(ToolResultPart::success(
                call.id.clone(),
                call.name.clone(),
                output,
            )),
            Self::Error { message, .. } => Some(ToolResultPart::error(
                call.id.clone(),
                call.name.clone(),
                message,
            )),
            Self::Suspended(_) => None,
        }
    }
}

/// What a suspended tool call is waiting on.
#[derive(Debug, Clone, PartialEq)]
pub enum SuspendedTool {
    /// The call itself needs a human approval.
    Approval(ToolApprovalSuspension),
    /// A sub-agent run underneath this call suspended.
    SubAgent(SubAgentSuspension),
}

/// A sub-agent run that suspended while handling a tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct SubAgentSuspension {
    /// Persisted state id of the child run.
    pub state_id: RunId,
    /// Manifest id of the child.
    pub manifest_id: AgentId,
    /// Approvals the child owns directly.
    pub suspensions: Vec<ToolApprovalSuspension>,
    /// Deeper stacks, rooted at the child.
    pub suspension_stacks: Vec<SuspensionStack>,
}

/// Per-invocation context handed to context-aware tools.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Correlation and cancellation scope of the run.
    pub context: Context,
    /// Message history at dispatch time.
    pub messages: Arc<Vec<Message>>,
    /// Step number of the dispatching step, 1-based.
    pub step_number: u32,
    /// Tool call ids whose approval has been granted on resume.
    pub grants: Arc<HashSet<ToolCallId>>,
    /// Child run ids spawned during this dispatch; drained by the loop
    /// into the persisted state.
    pub spawned_children: Arc<std::sync::Mutex<Vec<RunId>>>,
}

impl ExecutionContext {
    /// Create a context for one dispatch batch.
    #[must_use]
    pub fn new(context: Context, messages: Vec<Message>, step_number: u32) -> Self {
        Self {
            context,
            messages: Arc::new(messages),
            step_number,
            grants: Arc::new(HashSet::new()),
            spawned_children: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    /// Grant approval for specific tool call ids (used on resume).
    #[must_use]
    pub fn with_grants(mut self, grants: HashSet<ToolCallId>) -> Self {
        self.grants = Arc::new(grants);
        self
    }

    /// Whether the given call has an approval grant.
    #[must_use]
    pub fn is_granted(&self, call_id: &ToolCallId) -> bool {
        self.grants.contains(call_id)
    }

    /// Record a spawned child run.
    pub fn record_child(&self, run_id: RunId) {
        if let Ok(mut children) = self.spawned_children.lock() {
            children.push(run_id);
        }
    }

    /// Drain the recorded child run ids.
    #[must_use]
    pub fn take_children(&self) -> Vec<RunId> {
        self.spawned_children
            .lock()
            .map(|mut children| std::mem::take(&mut *children))
            .unwrap_or_default()
    }
}

/// A pure tool: JSON in, JSON out.
#[async_trait]
pub trait PlainTool: Send + Sync {
    /// Execute with the given input and the message history.
    async fn execute(&self, input: Value, messages: &[Message]) -> Result<Value>;
}

/// A tool that needs the execution context (cancellation, grants).
#[async_trait]
pub trait ContextTool: Send + Sync {
    /// Execute the call, producing a full outcome.
    async fn execute(&self, call: &ToolCallPart, ctx: &ExecutionContext) -> ToolOutcome;
}

/// A context-aware tool that also emits events while executing.
#[async_trait]
pub trait StreamingContextTool: Send + Sync {
    /// Execute the call, emitting events through the sink as it runs.
    async fn execute(
        &self,
        call: &ToolCallPart,
        ctx: &ExecutionContext,
        sink: &EventSink,
    ) -> ToolOutcome;
}

/// Executor shapes, dispatched on by the harness.
#[derive(Clone)]
pub enum ToolExecutor {
    /// A pure capability.
    Plain(Arc<dyn PlainTool>),
    /// A context-aware capability.
    Context(Arc<dyn ContextTool>),
    /// A context-aware, event-emitting capability.
    StreamingContext(Arc<dyn StreamingContextTool>),
}

impl std::fmt::Debug for ToolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Plain(_) => "Plain",
            Self::Context(_) => "Context",
            Self::StreamingContext(_) => "StreamingContext",
        })
    }
}

/// A named capability exposed to the model.
#[derive(Clone)]
pub struct Tool {
    definition: ToolDefinition,
    executor: ToolExecutor,
    requires_approval: bool,
    approval_description: Option<String>,
    middleware: Vec<Arc<dyn ToolMiddleware>>,
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.definition.name)
            .field("executor", &self.executor)
            .field("requires_approval", &self.requires_approval)
            .finish_non_exhaustive()
    }
}

impl Tool {
    /// Create a plain tool.
    #[must_use]
    pub fn plain(definition: ToolDefinition, executor: Arc<dyn PlainTool>) -> Self {
        Self {
            definition,
            executor: ToolExecutor::Plain(executor),
            requires_approval: false,
            approval_description: None,
            middleware: Vec::new(),
        }
    }

    /// Create a context-aware tool.
    #[must_use]
    pub fn context(definition: ToolDefinition, executor: Arc<dyn ContextTool>) -> Self {
        Self {
            definition,
            executor: ToolExecutor::Context(executor),
            requires_approval: false,
            approval_description: None,
            middleware: Vec::new(),
        }
    }

    /// Create a streaming-context tool.
    #[must_use]
    pub fn streaming(definition: ToolDefinition, executor: Arc<dyn StreamingContextTool>) -> Self {
        Self {
            definition,
            executor: ToolExecutor::StreamingContext(executor),
            requires_approval: false,
            approval_description: None,
            middleware: Vec::new(),
        }
    }

    /// Gate this tool behind human approval.
    #[must_use]
    pub fn with_approval(mut self, description: Option<String>) -> Self {
        self.requires_approval = true;
        self.approval_description = description;
        self
    }

    /// Attach a per-tool middleware layer (applied inside the global chain).
    #[must_use]
    pub fn with_middleware(mut self, layer: Arc<dyn ToolMiddleware>) -> Self {
        self.middleware.push(layer);
        self
    }

    /// Tool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// The declarative definition.
    #[must_use]
    pub const fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    /// The executor shape.
    #[must_use]
    pub const fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    /// Whether the tool is approval-gated.
    #[must_use]
    pub const fn requires_approval(&self) -> bool {
        self.requires_approval
    }

    /// Human-readable description for approval prompts.
    #[must_use]
    pub fn approval_description(&self) -> Option<&str> {
        self.approval_description.as_deref()
    }

    /// Per-tool middleware layers.
    #[must_use]
    pub fn middleware(&self) -> &[Arc<dyn ToolMiddleware>] {
        &self.middleware
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl PlainTool for Echo {
        async fn execute(&self, input: Value, _messages: &[Message]) -> Result<Value> {
            Ok(input)
        }
    }

    fn echo_tool() -> Tool {
        Tool::plain(
            ToolDefinition::new("echo", "Echoes its input.", serde_json::json!({"type": "object"})),
            Arc::new(Echo),
        )
    }

    mod definition {
        use super::*;

        #[derive(JsonSchema)]
        #[allow(dead_code)]
        struct EchoArgs {
            message: String,
        }

        #[test]
        fn for_type_derives_a_schema() {
            let def = ToolDefinition::for_type::<EchoArgs>("echo", "Echoes.");
            assert_eq!(def.name, "echo");
            let props = def.parameters.get("properties").expect("schema properties");
            assert!(props.get("message").is_some());
        }

        #[test]
        fn serde_roundtrip() {
            let def = ToolDefinition::new("t", "d", serde_json::json!({"type": "object"}));
            let json = serde_json::to_string(&def).unwrap();
            let parsed: ToolDefinition = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, def);
        }
    }

    mod outcome {
        use super::*;

        fn call() -> ToolCallPart {
            ToolCallPart::new(ToolCallId::new("c1"), "echo", serde_json::json!({"x": 1}))
        }

        #[test]
        fn success_becomes_result_part() {
            let part = ToolOutcome::Success(serde_json::json!(42))
                .into_result_part(&call())
                .expect("completed outcome");
            assert!(!part.is_error);
            assert_eq!(part.output, serde_json::json!(42));
            assert_eq!(part.tool_name, "echo");
        }

        #[test]
        fn error_becomes_error_part() {
            let part = ToolOutcome::error("boom", outcome_code::EXECUTION_ERROR)
                .into_result_part(&call())
                .expect("completed outcome");
            assert!(part.is_error);
            assert_eq!(part.output, Value::String("boom".to_owned()));
        }

        #[test]
        fn suspension_has_no_result_part() {
            let outcome = ToolOutcome::Suspended(SuspendedTool::Approval(ToolApprovalSuspension {
                approval_id: crate::id::ApprovalId::new("ap-1"),
                tool_call_id: ToolCallId::new("c1"),
                tool_name: "danger".to_owned(),
                tool_args: Value::Null,
                description: None,
            }));
            assert!(outcome.is_suspended());
            assert!(outcome.into_result_part(&call()).is_none());
        }
    }

    mod execution_context {
        use super::*;

        #[test]
        fn grants_are_checked_by_call_id() {
            let ctx = ExecutionContext::new(Context::new(), Vec::new(), 1)
                .with_grants([ToolCallId::new("c1")].into_iter().collect());
            assert!(ctx.is_granted(&ToolCallId::new("c1")));
            assert!(!ctx.is_granted(&ToolCallId::new("c2")));
        }

        #[test]
        fn children_are_recorded_and_drained() {
            let ctx = ExecutionContext::new(Context::new(), Vec::new(), 1);
            ctx.record_child(RunId::new("child-1"));
            ctx.record_child(RunId::new("child-2"));
            assert_eq!(
                ctx.take_children(),
                vec![RunId::new("child-1"), RunId::new("child-2")]
            );
            assert!(ctx.take_children().is_empty());
        }
    }

    mod shape {
        use super::*;

        #[test]
        fn plain_tool_has_plain_shape() {
            assert!(matches!(echo_tool().executor(), ToolExecutor::Plain(_)));
        }

        #[test]
        fn approval_gate_is_configured() {
            let tool = echo_tool().with_approval(Some("echoes data".to_owned()));
            assert!(tool.requires_approval());
            assert_eq!(tool.approval_description(), Some("echoes data"));
        }
    }
}
