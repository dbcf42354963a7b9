//! Cooperative cancellation channel.
//!
//! Cancellation is requested out of band by writing a TTL-scoped signal
//! keyed by run id. Nothing is interrupted synchronously: running agents
//! poll the channel at every step boundary and from a background watcher
//! that trips the run's cancellation token mid-step.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::KvCache;
use crate::error::Result;
use crate::id::RunId;

/// Cache key for a cancellation signal.
#[must_use]
pub fn cancellation_key(run_id: &RunId) -> String {
    format!("agent-cancellation:{run_id}")
}

/// A persisted cancellation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationSignal {
    /// The run to cancel.
    pub run_id: RunId,
    /// When cancellation was requested.
    pub cancelled_at: DateTime<Utc>,
    /// Optional operator-supplied reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// TTL-scoped keyed cancellation signals over a [`KvCache`].
#[derive(Clone)]
pub struct CancellationChannel {
    cache: Arc<dyn KvCache>,
    signal_ttl: Duration,
    poll_interval: Duration,
}

impl std::fmt::Debug for CancellationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationChannel")
            .field("signal_ttl", &self.signal_ttl)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl CancellationChannel {
    /// Create a channel with the given signal TTL and poll period.
    #[must_use]
    pub fn new(cache: Arc<dyn KvCache>, signal_ttl: Duration, poll_interval: Duration) -> Self {
        Self {
            cache,
            signal_ttl,
            poll_interval,
        }
    }

    /// Request cancellation of a run. Returns without waiting for the run
    /// to observe the signal.
    pub async fn request(&self, run_id: &RunId, reason: Option<String>) -> Result<()> {
        let signal = CancellationSignal {
            run_id: run_id.clone(),
            cancelled_at: Utc::now(),
            reason,
        };
        let value = serde_json::to_string(&signal)?;
        self.cache
            .set(&cancellation_key(run_id), value, self.signal_ttl)
            .await
    }

    /// Read the pending signal for a run, if any.
    pub async fn peek(&self, run_id: &RunId) -> Result<Option<CancellationSignal>> {
        match self.cache.get(&cancellation_key(run_id)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    /// Remove the signal for a run (after it has been observed).
    pub async fn clear(&self, run_id: &RunId) -> Result<bool> {
        self.cache.del(&cancellation_key(run_id)).await
    }

    /// Spawn a watcher that polls the channel and trips `token` when a
    /// signal appears. The watcher stops when the token is cancelled from
    /// either side or the returned handle is dropped.
    #[must_use]
    pub fn watch(&self, run_id: RunId, token: CancellationToken) -> CancellationWatch {
        let channel = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(channel.poll_interval) => {
                        match channel.peek(&run_id).await {
                            Ok(Some(signal)) => {
                                debug!(run_id = %run_id, reason = ?signal.reason, "Cancellation signal observed");
                                token.cancel();
                                break;
                            }
                            Ok(None) => {}
                            Err(err) => {
                                debug!(run_id = %run_id, error = %err, "Cancellation poll failed");
                            }
                        }
                    }
                }
            }
        });
        CancellationWatch { handle }
    }
}

/// Handle to a background cancellation watcher; aborts the watcher on drop.
#[derive(Debug)]
pub struct CancellationWatch {
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for CancellationWatch {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
