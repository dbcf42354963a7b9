//! The service facade.
//!
//! [`AgentService`] composes the runtime: graph validation, run-lock
//! discipline, input preparation, the loop, and the streaming pipeline.
//! It is fully dependency-injected; no global state. The concurrency
//! guarantee is at most one in-flight execution per run id: a second
//! attempt while the lock is held surfaces as a `Conflict` error.

use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::blob::{BlobStore, InMemoryBlobStore};
use crate::cache::{InMemoryKvCache, KvCache};
use crate::cancel::CancellationChannel;
use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::error::{Error, ErrorCode, ErrorDetail, Result};
use crate::harness::ToolHarness;
use crate::id::{AgentId, RunId};
use crate::lock::{CacheRunLock, RunLock, RunLockGuard};
use crate::manifest::{AgentManifest, ManifestMap};
use crate::result::{AgentInput, AgentRunResult, CancelOutcome};
use crate::runner::RunEnv;
use crate::state::{AgentState, AgentStatus};
use crate::store::StateStore;
use crate::streaming::{AgentStream, EventSink, STREAM_BUFFER, StreamAgentItem};

/// The manifest set and root for one run invocation.
#[derive(Debug)]
pub struct RunSpec {
    /// Manifests reachable in this run.
    pub manifests: Vec<AgentManifest>,
    /// Id of the root manifest.
    pub root: AgentId,
}

impl RunSpec {
    /// Create a run spec.
    #[must_use]
    pub fn new(manifests: Vec<AgentManifest>, root: impl Into<AgentId>) -> Self {
        Self {
            manifests,
            root: root.into(),
        }
    }
}

/// Durable agent orchestration service.
#[derive(Clone)]
pub struct AgentService {
    env: Arc<RunEnv>,
    lock: Arc<dyn RunLock>,
}

impl std::fmt::Debug for AgentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentService").finish_non_exhaustive()
    }
}

/// Builder wiring the service's collaborators.
pub struct AgentServiceBuilder {
    cache: Option<Arc<dyn KvCache>>,
    blobs: Option<Arc<dyn BlobStore>>,
    lock: Option<Arc<dyn RunLock>>,
    harness: Option<ToolHarness>,
    config: RuntimeConfig,
}

impl std::fmt::Debug for AgentServiceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentServiceBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AgentServiceBuilder {
    /// Use the given keyed cache for state, locks and signals.
    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn KvCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use the given blob store for offloaded message content.
    #[must_use]
    pub fn blobs(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    /// Use the given run lock.
    #[must_use]
    pub fn lock(mut self, lock: Arc<dyn RunLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Use the given tool harness.
    #[must_use]
    pub fn harness(mut self, harness: ToolHarness) -> Self {
        self.harness = Some(harness);
        self
    }

    /// Use the given runtime configuration.
    #[must_use]
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the service.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the configuration is inconsistent.
    pub fn build(self) -> Result<AgentService> {
        self.config.validate()?;
        let cache: Arc<dyn KvCache> = self
            .cache
            .unwrap_or_else(|| Arc::new(InMemoryKvCache::new()));
        let blobs: Arc<dyn BlobStore> = self
            .blobs
            .unwrap_or_else(|| Arc::new(InMemoryBlobStore::new()));
        let lock: Arc<dyn RunLock> = self
            .lock
            .unwrap_or_else(|| Arc::new(CacheRunLock::new(Arc::clone(&cache))));
        let store = StateStore::new(Arc::clone(&cache), blobs, &self.config);
        let cancellation = CancellationChannel::new(
            Arc::clone(&cache),
            self.config.cancellation_signal_ttl,
            self.config.cancellation_poll_interval,
        );
        Ok(AgentService {
            env: Arc::new(RunEnv {
                config: self.config,
                store,
                cancellation,
                harness: self.harness.unwrap_or_else(ToolHarness::with_defaults),
            }),
            lock,
        })
    }
}

impl AgentService {
    /// Start building a service.
    #[must_use]
    pub fn builder() -> AgentServiceBuilder {
        AgentServiceBuilder {
            cache: None,
            blobs: None,
            lock: None,
            harness: None,
            config: RuntimeConfig::default(),
        }
    }

    /// A service over the in-memory transports with default configuration.
    #[must_use]
    pub fn in_memory() -> Self {
        // The default configuration always validates.
        match Self::builder().build() {
            Ok(service) => service,
            Err(_) => unreachable!("default configuration is valid"),
        }
    }

    /// Execute one input to a terminal (or durably paused) outcome.
    ///
    /// # Errors
    ///
    /// `BadRequest` for invalid graphs or transitions, `Conflict` when the
    /// run is already executing, `NotFound` for unknown run ids.
    pub async fn run(
        &self,
        ctx: &Context,
        spec: RunSpec,
        input: AgentInput,
    ) -> Result<AgentRunResult> {
        let manifests = ManifestMap::validate(spec.manifests, spec.root)?;
        let run_id = input
            .run_id()
            .cloned()
            .unwrap_or_else(RunId::generate);
        let guard = self.acquire(&run_id, ctx).await?;
        let sink = EventSink::null(manifests.root_id().clone());

        let result =
            crate::resume::execute(&self.env, &manifests, run_id.clone(), input, ctx, &sink).await;
        self.finish(&run_id, &guard, result.as_ref().ok()).await;
        result
    }

    /// Execute one input, exposing events lazily. The run lock is held for
    /// the lifetime of the stream; the stream ends with exactly one
    /// [`StreamAgentItem::Final`].
    ///
    /// # Errors
    ///
    /// Graph and configuration problems are returned eagerly; execution
    /// errors arrive as the final item.
    pub async fn stream(
        &self,
        ctx: &Context,
        spec: RunSpec,
        input: AgentInput,
    ) -> Result<AgentStream> {
        let manifests = ManifestMap::validate(spec.manifests, spec.root)?;
        let run_id = input
            .run_id()
            .cloned()
            .unwrap_or_else(RunId::generate);

        let (tx, mut rx) = mpsc::channel::<StreamAgentItem>(STREAM_BUFFER);
        let run_ctx = ctx.child();
        let root = manifests.root();
        let sink = EventSink::channel(
            tx.clone(),
            root.id.clone(),
            root.streaming_events.clone(),
            run_ctx.cancellation_token().clone(),
        );

        let service = self.clone();
        let holder = ctx.correlation_id().to_owned();
        let task_run_id = run_id.clone();
        tokio::spawn(async move {
            let guard = match RunLockGuard::acquire(
                Arc::clone(&service.lock),
                &task_run_id,
                &holder,
                service.env.config.agent_run_lock_ttl,
            )
            .await
            {
                Ok(Some(guard)) => guard,
                Ok(None) => {
                    let _ = tx
                        .send(StreamAgentItem::Final(AgentRunResult::Error {
                            run_id: task_run_id.clone(),
                            error: ErrorDetail::new(
                                ErrorCode::Conflict,
                                "run is already executing",
                            ),
                        }))
                        .await;
                    return;
                }
                Err(err) => {
                    let _ = tx
                        .send(StreamAgentItem::Final(AgentRunResult::Error {
                            run_id: task_run_id.clone(),
                            error: err.detail(),
                        }))
                        .await;
                    return;
                }
            };

            let result = crate::resume::execute(
                &service.env,
                &manifests,
                task_run_id.clone(),
                input,
                &run_ctx,
                &sink,
            )
            .await;
            let final_result = result.unwrap_or_else(|err| AgentRunResult::Error {
                run_id: task_run_id.clone(),
                error: err.detail(),
            });
            service.finish(&task_run_id, &guard, Some(&final_result)).await;
            let _ = tx.send(StreamAgentItem::Final(final_result)).await;
        });

        Ok(Box::pin(async_stream::stream! {
            while let Some(item) = rx.recv().await {
                let is_final = matches!(item, StreamAgentItem::Final(_));
                yield item;
                if is_final {
                    break;
                }
            }
        }))
    }

    /// Request cancellation of a run.
    ///
    /// Suspended runs (and their descendant states) transition to
    /// `cancelled` directly; running runs receive a cooperative signal; a
    /// run whose state says running with no live lock holder and a stale
    /// heartbeat is declared crashed and marked failed.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown run ids.
    pub async fn cancel(&self, ctx: &Context, run_id: &RunId) -> Result<CancelOutcome> {
        let Some(mut state) = self.env.store.try_get(run_id).await? else {
            return Err(Error::not_found(format!("agent state not found: {run_id}"))
                .with_metadata("run_id", run_id.as_str()));
        };
        if state.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal {
                run_id: run_id.clone(),
            });
        }

        match state.status {
            AgentStatus::Suspended => {
                let Some(guard) = RunLockGuard::acquire(
                    Arc::clone(&self.lock),
                    run_id,
                    ctx.correlation_id(),
                    self.env.config.agent_run_lock_ttl,
                )
                .await?
                else {
                    // A resume is in flight; fall back to the signal.
                    self.env.cancellation.request(run_id, None).await?;
                    return Ok(CancelOutcome::Signalled {
                        run_id: run_id.clone(),
                    });
                };
                let result = cancel_tree(&self.env.store, &mut state).await;
                if let Err(err) = guard.release().await {
                    warn!(run_id = %run_id, error = %err, "Failed to release lock after cancel");
                }
                result?;
                info!(run_id = %run_id, "Suspended run cancelled");
                Ok(CancelOutcome::Cancelled {
                    run_id: run_id.clone(),
                })
            }
            AgentStatus::Running => {
                if let Some(guard) = RunLockGuard::acquire(
                    Arc::clone(&self.lock),
                    run_id,
                    ctx.correlation_id(),
                    self.env.config.agent_run_lock_ttl,
                )
                .await?
                {
                    // No live holder. A heartbeat older than the lock TTL
                    // means the executing process died.
                    let stale = Utc::now()
                        .signed_duration_since(state.updated_at)
                        .to_std()
                        .is_ok_and(|age| age > self.env.config.agent_run_lock_ttl);
                    let outcome = if stale {
                        state.set_status(AgentStatus::Failed);
                        self.env.store.set(&mut state).await?;
                        warn!(run_id = %run_id, "Declared crashed run failed");
                        CancelOutcome::AlreadyTerminal {
                            run_id: run_id.clone(),
                        }
                    } else {
                        self.env.cancellation.request(run_id, None).await?;
                        CancelOutcome::Signalled {
                            run_id: run_id.clone(),
                        }
                    };
                    if let Err(err) = guard.release().await {
                        warn!(run_id = %run_id, error = %err, "Failed to release lock after cancel");
                    }
                    Ok(outcome)
                } else {
                    self.env.cancellation.request(run_id, None).await?;
                    Ok(CancelOutcome::Signalled {
                        run_id: run_id.clone(),
                    })
                }
            }
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Cancelled => {
                Ok(CancelOutcome::AlreadyTerminal {
                    run_id: run_id.clone(),
                })
            }
        }
    }

    /// Read a run's persisted state without taking the lock. The value may
    /// be stale relative to an in-flight execution.
    pub async fn status(&self, run_id: &RunId) -> Result<Option<AgentState>> {
        self.env.store.try_get(run_id).await
    }

    async fn acquire(&self, run_id: &RunId, ctx: &Context) -> Result<RunLockGuard> {
        RunLockGuard::acquire(
            Arc::clone(&self.lock),
            run_id,
            ctx.correlation_id(),
            self.env.config.agent_run_lock_ttl,
        )
        .await?
        .ok_or_else(|| {
            Error::conflict("run is already executing").with_metadata("run_id", run_id.as_str())
        })
    }

    async fn finish(&self, run_id: &RunId, guard: &RunLockGuard, result: Option<&AgentRunResult>) {
        if result.is_some_and(|r| !r.is_suspended()) {
            // Terminal outcome: a pending signal has served its purpose.
            if let Err(err) = self.env.cancellation.clear(run_id).await {
                warn!(run_id = %run_id, error = %err, "Failed to clear cancellation signal");
            }
        }
        if let Err(err) = guard.release().await {
            warn!(run_id = %run_id, error = %err, "Failed to release run lock");
        }
    }
}

/// Cancel a suspended state and every non-terminal descendant.
fn cancel_tree<'a>(store: &'a StateStore, state: &'a mut AgentState) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        for child_id in state.child_state_ids.clone() {
            if let Some(mut child) = store.try_get(&child_id).await?
                && !child.status.is_terminal()
            {
                cancel_tree(store, &mut child).await?;
            }
        }
        state.set_status(AgentStatus::Cancelled);
        store.set(state).await?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::MockProvider;

    fn spec_with_text(text: &str) -> RunSpec {
        let provider = Arc::new(MockProvider::new(vec![MockProvider::text_step(&[text])]));
        let manifest = AgentManifest::builder("root", "1.0.0", provider)
            .name("root")
            .build();
        RunSpec::new(vec![manifest], "root")
    }

    #[tokio::test]
    async fn run_completes_a_text_only_agent() {
        let service = AgentService::in_memory();
        let ctx = Context::new();
        let result = service
            .run(&ctx, spec_with_text("Hello"), AgentInput::request("Say hello"))
            .await
            .unwrap();
        let AgentRunResult::Complete { text, .. } = result else {
            panic!("expected completion, got {result:?}");
        };
        assert_eq!(text.as_deref(), Some("Hello"));
    }

    #[tokio::test]
    async fn invalid_graph_is_rejected_before_any_work() {
        let service = AgentService::in_memory();
        let ctx = Context::new();
        let spec = RunSpec::new(Vec::new(), "ghost");
        let err = service
            .run(&ctx, spec, AgentInput::request("hi"))
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::BadRequest));
        // No state was created anywhere.
        assert!(
            service
                .status(&RunId::new("ghost"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn cancel_of_unknown_run_is_not_found() {
        let service = AgentService::in_memory();
        let ctx = Context::new();
        let err = service.cancel(&ctx, &RunId::new("ghost")).await.unwrap_err();
        assert!(err.is(ErrorCode::NotFound));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_on_terminal_runs() {
        let service = AgentService::in_memory();
        let ctx = Context::new();
        let result = service
            .run(&ctx, spec_with_text("done"), AgentInput::request("go"))
            .await
            .unwrap();
        let run_id = result.run_id().clone();

        for _ in 0..3 {
            let outcome = service.cancel(&ctx, &run_id).await.unwrap();
            assert_eq!(
                outcome,
                CancelOutcome::AlreadyTerminal {
                    run_id: run_id.clone()
                }
            );
        }
    }

    #[tokio::test]
    async fn reply_to_unknown_run_is_not_found() {
        let service = AgentService::in_memory();
        let ctx = Context::new();
        let err = service
            .run(
                &ctx,
                spec_with_text("x"),
                AgentInput::reply_text(RunId::new("ghost"), "more"),
            )
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::NotFound));
    }
}
