//! Run lifecycle hooks.
//!
//! Hooks let embedders observe run boundaries and tool execution without
//! consuming the event stream. All methods have no-op defaults; implement
//! only the notification points you care about.

use async_trait::async_trait;

use crate::context::Context;

/// Observer of run lifecycle notification points.
#[async_trait]
pub trait RunHooks: Send + Sync {
    /// Called once when a run (or resumed run) starts executing.
    async fn agent_start(&self, _ctx: &Context, _agent_name: &str) {}

    /// Called once when a run reaches a terminal state.
    async fn agent_end(&self, _ctx: &Context, _agent_name: &str, _status: &str) {}

    /// Called before each tool invocation.
    async fn tool_start(&self, _ctx: &Context, _tool_name: &str) {}

    /// Called after each tool invocation with a summary of the outcome.
    async fn tool_end(&self, _ctx: &Context, _tool_name: &str, _outcome: &str) {}
}

/// Hooks implementation that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRunHooks;

#[async_trait]
impl RunHooks for NoopRunHooks {}
