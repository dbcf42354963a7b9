//! Abstract keyed cache with TTL.
//!
//! The runtime persists state, locks and cancellation signals through this
//! interface. A production deployment backs it with a shared store (e.g.
//! Redis); the in-memory implementation ships for tests and single-process
//! embedding.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::Result;

/// A string-keyed cache with per-entry TTL.
#[async_trait]
pub trait KvCache: Send + Sync {
    /// Read a value. Expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value with a TTL, replacing any existing entry.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Write a value only if the key is absent (or expired). Returns whether
    /// the write happened. Must be atomic with respect to concurrent
    /// `set_nx` calls on the same key.
    async fn set_nx(&self, key: &str, value: String, ttl: Duration) -> Result<bool>;

    /// Delete a key. Returns whether a live entry existed.
    async fn del(&self, key: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// In-memory [`KvCache`] for tests and single-process embedding.
///
/// Expiry uses the tokio clock, so tests may pause and advance time.
#[derive(Debug, Default)]
pub struct InMemoryKvCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryKvCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    /// Whether the cache holds no live entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KvCache for InMemoryKvCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().await.insert(key.to_owned(), entry);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: String, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(key)
            && !existing.is_expired(now)
        {
            return Ok(false);
        }
        entries.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.remove(key) {
            Some(entry) => Ok(!entry.is_expired(now)),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn set_then_get() {
        let cache = InMemoryKvCache::new();
        cache.set("k", "v".to_owned(), TTL).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn missing_key_reads_as_none() {
        let cache = InMemoryKvCache::new();
        assert_eq!(cache.get("absent").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let cache = InMemoryKvCache::new();
        cache
            .set("k", "v".to_owned(), Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn set_nx_respects_existing() {
        let cache = InMemoryKvCache::new();
        assert!(cache.set_nx("k", "a".to_owned(), TTL).await.unwrap());
        assert!(!cache.set_nx("k", "b".to_owned(), TTL).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn set_nx_succeeds_after_expiry() {
        let cache = InMemoryKvCache::new();
        cache
            .set_nx("k", "a".to_owned(), Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.set_nx("k", "b".to_owned(), TTL).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn del_reports_presence() {
        let cache = InMemoryKvCache::new();
        cache.set("k", "v".to_owned(), TTL).await.unwrap();
        assert!(cache.del("k").await.unwrap());
        assert!(!cache.del("k").await.unwrap());
    }
}
