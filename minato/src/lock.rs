//! Per-run distributed lock.
//!
//! State is mutated only by the lock holder; at most one execution is in
//! flight per run id across all processes. The lock TTL doubles as a
//! crash-detection heartbeat: a run whose state says `running` but whose
//! lock is acquirable and whose `updated_at` is older than the TTL is
//! declared crashed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::cache::KvCache;
use crate::error::Result;
use crate::id::RunId;

/// Cache key for a run lock.
#[must_use]
pub fn run_lock_key(run_id: &RunId) -> String {
    format!("lock:agent-run:{run_id}")
}

/// A namespaced distributed lock with owner-checked release.
#[async_trait]
pub trait RunLock: Send + Sync {
    /// Atomically acquire the lock for `holder_id`. Returns whether the
    /// acquisition succeeded.
    async fn try_acquire(&self, key: &str, holder_id: &str, ttl: Duration) -> Result<bool>;

    /// Release the lock if `holder_id` still owns it. Returns whether a
    /// release happened.
    async fn release(&self, key: &str, holder_id: &str) -> Result<bool>;

    /// Refresh the TTL if `holder_id` still owns the lock.
    async fn extend(&self, key: &str, holder_id: &str, ttl: Duration) -> Result<bool>;

    /// Whether any holder currently owns the lock.
    async fn is_locked(&self, key: &str) -> Result<bool>;
}

/// [`RunLock`] over an abstract [`KvCache`].
///
/// `set_nx` gives atomic acquisition. Release and extend are check-then-act
/// over the cache; backends with richer primitives (scripts, CAS) should
/// implement the trait directly for strict owner-check atomicity.
#[derive(Clone)]
pub struct CacheRunLock {
    cache: Arc<dyn KvCache>,
}

impl std::fmt::Debug for CacheRunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRunLock").finish_non_exhaustive()
    }
}

impl CacheRunLock {
    /// Create a lock backed by the given cache.
    #[must_use]
    pub fn new(cache: Arc<dyn KvCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl RunLock for CacheRunLock {
    async fn try_acquire(&self, key: &str, holder_id: &str, ttl: Duration) -> Result<bool> {
        self.cache.set_nx(key, holder_id.to_owned(), ttl).await
    }

    async fn release(&self, key: &str, holder_id: &str) -> Result<bool> {
        match self.cache.get(key).await? {
            Some(owner) if owner == holder_id => self.cache.del(key).await,
            _ => Ok(false),
        }
    }

    async fn extend(&self, key: &str, holder_id: &str, ttl: Duration) -> Result<bool> {
        match self.cache.get(key).await? {
            Some(owner) if owner == holder_id => {
                self.cache.set(key, holder_id.to_owned(), ttl).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_locked(&self, key: &str) -> Result<bool> {
        Ok(self.cache.get(key).await?.is_some())
    }
}

/// Holds an acquired run lock and guarantees release.
///
/// Call [`RunLockGuard::release`] on every exit path; the `Drop`
/// implementation is a backstop that schedules an asynchronous release when
/// a guard is dropped while still held (e.g. on a panic unwinding through
/// the run loop).
pub struct RunLockGuard {
    lock: Arc<dyn RunLock>,
    key: String,
    holder_id: String,
    released: AtomicBool,
}

impl std::fmt::Debug for RunLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLockGuard")
            .field("key", &self.key)
            .field("holder_id", &self.holder_id)
            .finish_non_exhaustive()
    }
}

impl RunLockGuard {
    /// Try to acquire the lock for a run; returns `None` when another
    /// holder owns it.
    pub async fn acquire(
        lock: Arc<dyn RunLock>,
        run_id: &RunId,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<Self>> {
        let key = run_lock_key(run_id);
        if lock.try_acquire(&key, holder_id, ttl).await? {
            Ok(Some(Self {
                lock,
                key,
                holder_id: holder_id.to_owned(),
                released: AtomicBool::new(false),
            }))
        } else {
            Ok(None)
        }
    }

    /// Refresh the lock TTL.
    pub async fn extend(&self, ttl: Duration) -> Result<bool> {
        self.lock.extend(&self.key, &self.holder_id, ttl).await
    }

    /// Release the lock.
    pub async fn release(&self) -> Result<bool> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.lock.release(&self.key, &self.holder_id).await
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        if self.released.load(Ordering::SeqCst) {
            return;
        }
        let lock = Arc::clone(&self.lock);
        let key = std::mem::take(&mut self.key);
        let holder_id = std::mem::take(&mut self.holder_id);
        warn!(key = %key, "Run lock guard dropped while held; releasing in background");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = lock.release(&key, &holder_id).await;
            });
        }
    }
}
