//! Durable persistence of [`AgentState`].
//!
//! States are serialized to JSON and written to the keyed cache under
//! `agent-states:<RunId>`. Inline binary message content never reaches the
//! cache: on write it is uploaded to blob storage and replaced with an
//! opaque marker; on read, markers are rewritten into short-lived signed
//! download URLs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::blob::{AGENT_CONTENT_FOLDER, BlobStore};
use crate::cache::KvCache;
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::id::RunId;
use crate::message::{BinaryData, ContentPart, Message};
use crate::state::{AgentState, STATE_SCHEMA_VERSION};

/// Cache key for a persisted state.
#[must_use]
pub fn state_key(run_id: &RunId) -> String {
    format!("agent-states:{run_id}")
}

/// Persists [`AgentState`] with TTL, offloading binary message content.
#[derive(Clone)]
pub struct StateStore {
    cache: Arc<dyn KvCache>,
    blobs: Arc<dyn BlobStore>,
    state_ttl: Duration,
    content_ttl: Duration,
    url_expiry: Duration,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("state_ttl", &self.state_ttl)
            .field("content_ttl", &self.content_ttl)
            .finish_non_exhaustive()
    }
}

impl StateStore {
    /// Create a store over the given transports.
    #[must_use]
    pub fn new(cache: Arc<dyn KvCache>, blobs: Arc<dyn BlobStore>, config: &RuntimeConfig) -> Self {
        Self {
            cache,
            blobs,
            state_ttl: config.agent_state_ttl,
            content_ttl: config.agent_content_ttl,
            url_expiry: config.download_url_expiry,
        }
    }

    /// Load a state, failing with `NotFound` when absent.
    pub async fn get(&self, run_id: &RunId) -> Result<AgentState> {
        self.try_get(run_id).await?.ok_or_else(|| {
            Error::not_found(format!("agent state not found: {run_id}"))
                .with_metadata("run_id", run_id.as_str())
        })
    }

    /// Load a state, returning `None` when absent.
    pub async fn try_get(&self, run_id: &RunId) -> Result<Option<AgentState>> {
        let Some(raw) = self.cache.get(&state_key(run_id)).await? else {
            return Ok(None);
        };
        let mut state: AgentState = serde_json::from_str(&raw)
            .map_err(|err| Error::validation("malformed agent state").with_source(err))?;
        if state.schema_version != STATE_SCHEMA_VERSION {
            return Err(Error::validation(format!(
                "unsupported state schema version {}",
                state.schema_version
            ))
            .with_metadata("run_id", run_id.as_str()));
        }
        self.refresh_download_urls(&mut state).await;
        Ok(Some(state))
    }

    /// Persist a state, stamping `updated_at` and offloading any inline
    /// binary content.
    pub async fn set(&self, state: &mut AgentState) -> Result<()> {
        self.offload_binary_content(state).await?;
        state.updated_at = Utc::now();
        let raw = serde_json::to_string(state)?;
        self.cache
            .set(&state_key(&state.id), raw, self.state_ttl)
            .await?;
        debug!(run_id = %state.id, status = %state.status, "Persisted agent state");
        Ok(())
    }

    /// Delete a state. Returns whether it existed.
    pub async fn del(&self, run_id: &RunId) -> Result<bool> {
        self.cache.del(&state_key(run_id)).await
    }

    /// Upload inline binary parts and replace them with blob markers.
    /// Signed-URL parts are normalized back to their underlying marker so
    /// the persisted form is stable across read/write cycles.
    async fn offload_binary_content(&self, state: &mut AgentState) -> Result<()> {
        for message in &mut state.messages {
            let parts = match message {
                Message::User { content } | Message::Assistant { content, .. } => content,
                Message::System { .. } | Message::Tool { .. } => continue,
            };
            for part in parts {
                let ContentPart::Binary(binary) = part else {
                    continue;
                };
                match &binary.data {
                    BinaryData::Inline { .. } => {
                        let bytes = binary.decode().ok_or_else(|| {
                            Error::validation("inline binary content is not valid base64")
                        })?;
                        let uri = self
                            .blobs
                            .upload(
                                AGENT_CONTENT_FOLDER,
                                &binary.content_type,
                                bytes,
                                self.content_ttl,
                            )
                            .await?;
                        binary.data = BinaryData::Blob { uri };
                    }
                    BinaryData::Url { uri, .. } => {
                        binary.data = BinaryData::Blob { uri: uri.clone() };
                    }
                    BinaryData::Blob { .. } => {}
                }
            }
        }
        Ok(())
    }

    /// Rewrite blob markers into signed download URLs. Signing failures are
    /// logged and leave the marker in place.
    async fn refresh_download_urls(&self, state: &mut AgentState) {
        for message in &mut state.messages {
            let parts = match message {
                Message::User { content } | Message::Assistant { content, .. } => content,
                Message::System { .. } | Message::Tool { .. } => continue,
            };
            for part in parts {
                let ContentPart::Binary(binary) = part else {
                    continue;
                };
                let BinaryData::Blob { uri } = &binary.data else {
                    continue;
                };
                match self.blobs.signed_url(uri, self.url_expiry).await {
                    Ok(signed) => {
                        binary.data = BinaryData::Url {
                            url: signed.url,
                            uri: uri.clone(),
                            expires_at: signed.expires_at,
                        };
                    }
                    Err(err) => {
                        warn!(uri = %uri, error = %err, "Failed to sign download URL");
                    }
                }
            }
        }
    }
}
