//! Abstract blob storage for offloaded message content.
//!
//! Binary message payloads are uploaded here on state write and replaced
//! with opaque URIs; on state read, URIs are rewritten into short-lived
//! signed download URLs. The in-memory implementation ships for tests and
//! single-process embedding.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Folder under which agent message content is stored.
pub const AGENT_CONTENT_FOLDER: &str = "agents/content";

/// A signed, time-limited download URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrl {
    /// The URL itself.
    pub url: String,
    /// When the URL stops working.
    pub expires_at: DateTime<Utc>,
}

/// Binary storage with signed download URLs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload bytes under a folder; returns an opaque URI.
    async fn upload(
        &self,
        folder: &str,
        content_type: &str,
        bytes: Vec<u8>,
        ttl: Duration,
    ) -> Result<String>;

    /// Download the bytes behind a URI.
    async fn download(&self, uri: &str) -> Result<Vec<u8>>;

    /// Produce a signed download URL for a URI. Each call produces a
    /// distinct URL even for identical inputs.
    async fn signed_url(&self, uri: &str, expiry: Duration) -> Result<SignedUrl>;
}

#[derive(Debug, Clone)]
struct StoredBlob {
    bytes: Vec<u8>,
    expires_at: Instant,
}

/// In-memory [`BlobStore`] for tests and single-process embedding.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<HashMap<String, StoredBlob>>,
}

impl InMemoryBlobStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live blobs.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.blobs
            .lock()
            .await
            .values()
            .filter(|blob| blob.expires_at > now)
            .count()
    }

    /// Whether the store holds no live blobs.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn upload(
        &self,
        folder: &str,
        _content_type: &str,
        bytes: Vec<u8>,
        ttl: Duration,
    ) -> Result<String> {
        let uri = format!("mem://{folder}/{}", uuid::Uuid::new_v4());
        let blob = StoredBlob {
            bytes,
            expires_at: Instant::now() + ttl,
        };
        self.blobs.lock().await.insert(uri.clone(), blob);
        Ok(uri)
    }

    async fn download(&self, uri: &str) -> Result<Vec<u8>> {
        let now = Instant::now();
        let blobs = self.blobs.lock().await;
        match blobs.get(uri) {
            Some(blob) if blob.expires_at > now => Ok(blob.bytes.clone()),
            _ => Err(Error::not_found(format!("blob not found: {uri}"))),
        }
    }

    async fn signed_url(&self, uri: &str, expiry: Duration) -> Result<SignedUrl> {
        let now = Instant::now();
        {
            let blobs = self.blobs.lock().await;
            if !blobs
                .get(uri)
                .is_some_and(|blob| blob.expires_at > now)
            {
                return Err(Error::not_found(format!("blob not found: {uri}")));
            }
        }
        let expires_at = Utc::now()
            + chrono::Duration::from_std(expiry)
                .map_err(|_| Error::validation("expiry out of range"))?;
        Ok(SignedUrl {
            url: format!(
                "{uri}?expires={}&sig={}",
                expires_at.timestamp(),
                uuid::Uuid::new_v4().simple()
            ),
            expires_at,
        })
    }
}
