//! Tool execution harness.
//!
//! Executes one tool call through an ordered middleware chain and
//! shape-based dispatch. The chain is composed right-to-left at
//! construction: the first layer in the list is the outermost. Global
//! layers wrap per-tool layers, which wrap the terminal dispatch.
//!
//! Two checks run before the chain: an already-cancelled context returns a
//! `Cancelled` error without invoking the tool, and an approval-gated call
//! without a grant suspends with a fresh approval id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{Instrument as _, debug, info_span, warn};

use crate::id::ApprovalId;
use crate::message::ToolCallPart;
use crate::state::ToolApprovalSuspension;
use crate::streaming::EventSink;
use crate::tool::{
    ExecutionContext, SuspendedTool, Tool, ToolExecutor, ToolOutcome, outcome_code,
};

/// One layer of the tool execution chain.
#[async_trait]
pub trait ToolMiddleware: Send + Sync {
    /// Handle the invocation, calling `next` zero or more times.
    async fn handle(
        &self,
        tool: &Tool,
        call: &ToolCallPart,
        ctx: &ExecutionContext,
        sink: &EventSink,
        next: Next<'_>,
    ) -> ToolOutcome;
}

/// Continuation of the middleware chain.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    layers: &'a [Arc<dyn ToolMiddleware>],
}

impl std::fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.layers.len())
            .finish()
    }
}

impl<'a> Next<'a> {
    /// Run the remaining layers and, at the end of the chain, the tool
    /// itself.
    pub fn run(
        self,
        tool: &'a Tool,
        call: &'a ToolCallPart,
        ctx: &'a ExecutionContext,
        sink: &'a EventSink,
    ) -> BoxFuture<'a, ToolOutcome> {
        Box::pin(async move {
            match self.layers.split_first() {
                Some((layer, rest)) => {
                    layer
                        .handle(tool, call, ctx, sink, Next { layers: rest })
                        .await
                }
                None => dispatch(tool, call, ctx, sink).await,
            }
        })
    }
}

/// Terminal dispatch on the tool's executor shape.
async fn dispatch(
    tool: &Tool,
    call: &ToolCallPart,
    ctx: &ExecutionContext,
    sink: &EventSink,
) -> ToolOutcome {
    match tool.executor() {
        ToolExecutor::Plain(executor) => {
            match executor.execute(call.arguments.clone(), &ctx.messages).await {
                Ok(output) => ToolOutcome::Success(output),
                Err(err) => {
                    warn!(tool = %call.name, error = %err, "Tool execution failed");
                    ToolOutcome::error(err.to_string(), outcome_code::EXECUTION_ERROR)
                }
            }
        }
        ToolExecutor::Context(executor) => executor.execute(call, ctx).await,
        ToolExecutor::StreamingContext(executor) => executor.execute(call, ctx, sink).await,
    }
}

/// Executes tool calls through the configured middleware chain.
#[derive(Clone, Default)]
pub struct ToolHarness {
    middleware: Vec<Arc<dyn ToolMiddleware>>,
}

impl std::fmt::Debug for ToolHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolHarness")
            .field("layers", &self.middleware.len())
            .finish()
    }
}

impl ToolHarness {
    /// A harness with no global layers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A harness with the default observability layer.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new().layer(Arc::new(TracingMiddleware))
    }

    /// Append a global layer; earlier layers are outermost.
    #[must_use]
    pub fn layer(mut self, layer: Arc<dyn ToolMiddleware>) -> Self {
        self.middleware.push(layer);
        self
    }

    /// Execute one tool call.
    pub async fn execute(
        &self,
        tool: &Tool,
        call: &ToolCallPart,
        ctx: &ExecutionContext,
        sink: &EventSink,
    ) -> ToolOutcome {
        if ctx.context.is_cancelled() {
            return ToolOutcome::error("Operation cancelled", outcome_code::CANCELLED);
        }
        if tool.requires_approval() && !ctx.is_granted(&call.id) {
            let suspension = ToolApprovalSuspension {
                approval_id: ApprovalId::generate(),
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                tool_args: call.arguments.clone(),
                description: tool.approval_description().map(str::to_owned),
            };
            debug!(tool = %call.name, approval_id = %suspension.approval_id, "Tool call suspended for approval");
            return ToolOutcome::Suspended(SuspendedTool::Approval(suspension));
        }

        let chain: Vec<Arc<dyn ToolMiddleware>> = self
            .middleware
            .iter()
            .chain(tool.middleware())
            .map(Arc::clone)
            .collect();
        Next { layers: &chain }.run(tool, call, ctx, sink).await
    }
}

/// Spans and logs each invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMiddleware;

#[async_trait]
impl ToolMiddleware for TracingMiddleware {
    async fn handle(
        &self,
        tool: &Tool,
        call: &ToolCallPart,
        ctx: &ExecutionContext,
        sink: &EventSink,
        next: Next<'_>,
    ) -> ToolOutcome {
        let span = info_span!(
            "tool",
            tool.name = %call.name,
            tool.id = %call.id,
            tool.success = tracing::field::Empty,
            error = tracing::field::Empty,
        );
        async {
            let outcome = next.run(tool, call, ctx, sink).await;
            let current = tracing::Span::current();
            match &outcome {
                ToolOutcome::Success(_) => current.record("tool.success", true),
                ToolOutcome::Error { message, .. } => {
                    current.record("tool.success", false);
                    current.record("error", message.as_str())
                }
                ToolOutcome::Suspended(_) => current.record("tool.success", false),
            };
            outcome
        }
        .instrument(span)
        .await
    }
}

/// Re-runs the rest of the chain on retryable errors.
///
/// Retries stop once the context is cancelled.
#[derive(Debug, Clone, Copy)]
pub struct RetryMiddleware {
    /// Total attempts, including the first.
    pub max_attempts: u32,
}

impl RetryMiddleware {
    /// Retry up to `max_attempts` total attempts.
    #[must_use]
    pub const fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }
}

#[async_trait]
impl ToolMiddleware for RetryMiddleware {
    async fn handle(
        &self,
        tool: &Tool,
        call: &ToolCallPart,
        ctx: &ExecutionContext,
        sink: &EventSink,
        next: Next<'_>,
    ) -> ToolOutcome {
        let attempts = self.max_attempts.max(1);
        let mut outcome = next.run(tool, call, ctx, sink).await;
        for attempt in 1..attempts {
            match &outcome {
                ToolOutcome::Error {
                    retryable: true, ..
                } if !ctx.context.is_cancelled() => {
                    debug!(tool = %call.name, attempt, "Retrying tool call");
                    outcome = next.run(tool, call, ctx, sink).await;
                }
                ToolOutcome::Success(_)
                | ToolOutcome::Error { .. }
                | ToolOutcome::Suspended(_) => break,
            }
        }
        outcome
    }
}

/// Bounds one invocation's wall-clock time.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutMiddleware {
    /// Maximum duration for one invocation.
    pub timeout: Duration,
}

impl TimeoutMiddleware {
    /// Bound invocations to `timeout`.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ToolMiddleware for TimeoutMiddleware {
    async fn handle(
        &self,
        tool: &Tool,
        call: &ToolCallPart,
        ctx: &ExecutionContext,
        sink: &EventSink,
        next: Next<'_>,
    ) -> ToolOutcome {
        match tokio::time::timeout(self.timeout, next.run(tool, call, ctx, sink)).await {
            Ok(outcome) => outcome,
            Err(_) => ToolOutcome::error(
                format!("Tool '{}' timed out after {:?}", call.name, self.timeout),
                outcome_code::TIMEOUT,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::error::{Error, Result};
    use crate::id::{AgentId, ToolCallId};
    use crate::message::Message;
    use crate::tool::{PlainTool, ToolDefinition};
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Echo;

    #[async_trait]
    impl PlainTool for Echo {
        async fn execute(&self, input: Value, _messages: &[Message]) -> Result<Value> {
            Ok(input)
        }
    }

    struct Failing;

    #[async_trait]
    impl PlainTool for Failing {
        async fn execute(&self, _input: Value, _messages: &[Message]) -> Result<Value> {
            Err(Error::internal("kaput"))
        }
    }

    fn tool(name: &str, executor: Arc<dyn PlainTool>) -> Tool {
        Tool::plain(
            ToolDefinition::new(name, "test tool", serde_json::json!({"type": "object"})),
            executor,
        )
    }

    fn call(name: &str) -> ToolCallPart {
        ToolCallPart::new(ToolCallId::generate(), name, serde_json::json!({"x": 1}))
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(Context::new(), Vec::new(), 1)
    }

    fn sink() -> EventSink {
        EventSink::null(AgentId::new("test"))
    }

    #[tokio::test]
    async fn plain_success_flows_through() {
        let harness = ToolHarness::with_defaults();
        let outcome = harness
            .execute(&tool("echo", Arc::new(Echo)), &call("echo"), &ctx(), &sink())
            .await;
        assert_eq!(outcome, ToolOutcome::Success(serde_json::json!({"x": 1})));
    }

    #[tokio::test]
    async fn plain_failure_is_bounded_to_the_call() {
        let harness = ToolHarness::new();
        let outcome = harness
            .execute(&tool("bad", Arc::new(Failing)), &call("bad"), &ctx(), &sink())
            .await;
        let ToolOutcome::Error {
            code, retryable, ..
        } = outcome
        else {
            panic!("expected an error outcome");
        };
        assert_eq!(code, outcome_code::EXECUTION_ERROR);
        assert!(!retryable);
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let harness = ToolHarness::new();
        let ctx = ctx();
        ctx.context.cancel();
        let outcome = harness
            .execute(&tool("echo", Arc::new(Echo)), &call("echo"), &ctx, &sink())
            .await;
        let ToolOutcome::Error { code, message, .. } = outcome else {
            panic!("expected an error outcome");
        };
        assert_eq!(code, outcome_code::CANCELLED);
        assert_eq!(message, "Operation cancelled");
    }

    #[tokio::test]
    async fn approval_gate_suspends_without_grant() {
        let harness = ToolHarness::new();
        let gated = tool("danger", Arc::new(Echo)).with_approval(Some("does things".to_owned()));
        let call = call("danger");
        let outcome = harness.execute(&gated, &call, &ctx(), &sink()).await;
        let ToolOutcome::Suspended(SuspendedTool::Approval(suspension)) = outcome else {
            panic!("expected a suspension");
        };
        assert_eq!(suspension.tool_call_id, call.id);
        assert_eq!(suspension.tool_name, "danger");
        assert_eq!(suspension.description.as_deref(), Some("does things"));
    }

    #[tokio::test]
    async fn approval_gate_executes_with_grant() {
        let harness = ToolHarness::new();
        let gated = tool("danger", Arc::new(Echo)).with_approval(None);
        let call = call("danger");
        let ctx = ctx().with_grants([call.id.clone()].into_iter().collect());
        let outcome = harness.execute(&gated, &call, &ctx, &sink()).await;
        assert!(matches!(outcome, ToolOutcome::Success(_)));
    }

    struct FlakyTool {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl PlainTool for FlakyTool {
        async fn execute(&self, _input: Value, _messages: &[Message]) -> Result<Value> {
            if self.failures_left.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(Error::internal("transient"))
            } else {
                Ok(serde_json::json!("ok"))
            }
        }
    }

    /// Marks execution errors retryable so the retry layer kicks in.
    struct MarkRetryable;

    #[async_trait]
    impl ToolMiddleware for MarkRetryable {
        async fn handle(
            &self,
            tool: &Tool,
            call: &ToolCallPart,
            ctx: &ExecutionContext,
            sink: &EventSink,
            next: Next<'_>,
        ) -> ToolOutcome {
            match next.run(tool, call, ctx, sink).await {
                ToolOutcome::Error { message, code, .. } => ToolOutcome::Error {
                    message,
                    code,
                    retryable: true,
                },
                other => other,
            }
        }
    }

    #[tokio::test]
    async fn retry_layer_reruns_retryable_errors() {
        let harness = ToolHarness::new().layer(Arc::new(RetryMiddleware::new(3)));
        let flaky = tool(
            "flaky",
            Arc::new(FlakyTool {
                failures_left: AtomicU32::new(2),
            }),
        )
        .with_middleware(Arc::new(MarkRetryable));
        let outcome = harness.execute(&flaky, &call("flaky"), &ctx(), &sink()).await;
        assert_eq!(outcome, ToolOutcome::Success(serde_json::json!("ok")));
    }

    #[tokio::test]
    async fn retry_layer_gives_up_at_the_cap() {
        let harness = ToolHarness::new().layer(Arc::new(RetryMiddleware::new(2)));
        let flaky = tool(
            "flaky",
            Arc::new(FlakyTool {
                failures_left: AtomicU32::new(5),
            }),
        )
        .with_middleware(Arc::new(MarkRetryable));
        let outcome = harness.execute(&flaky, &call("flaky"), &ctx(), &sink()).await;
        assert!(matches!(outcome, ToolOutcome::Error { .. }));
    }

    struct SlowTool;

    #[async_trait]
    impl PlainTool for SlowTool {
        async fn execute(&self, _input: Value, _messages: &[Message]) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_layer_bounds_the_call() {
        let harness = ToolHarness::new();
        let slow = tool("slow", Arc::new(SlowTool))
            .with_middleware(Arc::new(TimeoutMiddleware::new(Duration::from_secs(1))));
        let outcome = harness.execute(&slow, &call("slow"), &ctx(), &sink()).await;
        let ToolOutcome::Error { code, .. } = outcome else {
            panic!("expected a timeout error");
        };
        assert_eq!(code, outcome_code::TIMEOUT);
    }

    /// Records the order in which layers observe the call.
    struct OrderProbe {
        label: &'static str,
        log: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl ToolMiddleware for OrderProbe {
        async fn handle(
            &self,
            tool: &Tool,
            call: &ToolCallPart,
            ctx: &ExecutionContext,
            sink: &EventSink,
            next: Next<'_>,
        ) -> ToolOutcome {
            if let Ok(mut log) = self.log.lock() {
                log.push(self.label);
            }
            next.run(tool, call, ctx, sink).await
        }
    }

    #[tokio::test]
    async fn first_layer_is_outermost_and_global_wraps_per_tool() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let harness = ToolHarness::new()
            .layer(Arc::new(OrderProbe {
                label: "global-1",
                log: Arc::clone(&log),
            }))
            .layer(Arc::new(OrderProbe {
                label: "global-2",
                log: Arc::clone(&log),
            }));
        let probed = tool("echo", Arc::new(Echo)).with_middleware(Arc::new(OrderProbe {
            label: "per-tool",
            log: Arc::clone(&log),
        }));
        harness.execute(&probed, &call("echo"), &ctx(), &sink()).await;
        assert_eq!(*log.lock().unwrap(), ["global-1", "global-2", "per-tool"]);
    }
}
