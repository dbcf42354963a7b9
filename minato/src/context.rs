//! Per-request execution context.
//!
//! A [`Context`] carries a correlation id and a cooperative cancellation
//! token. It is propagated through every call and derived for child runs:
//! cancelling a parent context cancels every derived child, while a child
//! can be cancelled independently without affecting the parent.

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Correlation scope and cancellation signal for one request.
#[derive(Debug, Clone)]
pub struct Context {
    correlation_id: String,
    cancellation: CancellationToken,
}

impl Context {
    /// Create a root context with a fresh correlation id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Create a root context with an explicit correlation id.
    #[must_use]
    pub fn with_correlation_id(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Derive a child context for a nested run.
    ///
    /// The child shares the correlation id; its cancellation is linked to
    /// the parent signal so that cancelling the parent unwinds the child.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            cancellation: self.cancellation.child_token(),
        }
    }

    /// Returns the correlation id of this context.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Request cooperative cancellation of this context and its children.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Check whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Await cancellation; resolves when [`Context::cancel`] is called on
    /// this context or any ancestor.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancellation.cancelled()
    }

    /// Returns the underlying cancellation token.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_contexts_have_unique_correlation_ids() {
        assert_ne!(Context::new().correlation_id(), Context::new().correlation_id());
    }

    #[test]
    fn child_shares_correlation_id() {
        let parent = Context::with_correlation_id("corr-1");
        let child = parent.child();
        assert_eq!(child.correlation_id(), "corr-1");
    }

    #[test]
    fn cancelling_parent_cancels_child() {
        let parent = Context::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn cancelling_child_leaves_parent_running() {
        let parent = Context::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let ctx = Context::new();
        let waiter = ctx.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        ctx.cancel();
        handle.await.unwrap();
    }
}
