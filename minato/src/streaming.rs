//! The streaming event pipeline.
//!
//! The run loop emits events through an [`EventSink`], which applies the
//! emitting manifest's event filter, stamps each event with manifest
//! attribution, a timestamp and a monotonic sequence number, and forwards
//! it into a bounded channel read by the consumer. Events are never
//! dropped: when the channel is full the producer blocks, which in turn
//! blocks the run loop (cooperative back-pressure). When the consumer goes
//! away, the sink trips the run's cancellation token so the loop unwinds.
//!
//! A stream yields [`StreamAgentItem`] values and always ends with exactly
//! one [`StreamAgentItem::Final`].

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ErrorDetail;
use crate::event::{AgentEvent, EventKind, EventPayload};
use crate::id::AgentId;
use crate::result::AgentRunResult;

/// Bounded channel capacity between the run loop and the stream consumer.
pub const STREAM_BUFFER: usize = 64;

/// One item of an agent event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamAgentItem {
    /// A streaming event.
    Event(AgentEvent),
    /// A non-terminal transport error (e.g. a malformed provider part).
    Error(ErrorDetail),
    /// The terminal item; the stream closes after yielding it.
    Final(AgentRunResult),
}

impl StreamAgentItem {
    /// The event, when this item is one.
    #[must_use]
    pub const fn as_event(&self) -> Option<&AgentEvent> {
        match self {
            Self::Event(event) => Some(event),
            Self::Error(_) | Self::Final(_) => None,
        }
    }

    /// The final result, when this item is the terminal one.
    #[must_use]
    pub const fn as_final(&self) -> Option<&AgentRunResult> {
        match self {
            Self::Final(result) => Some(result),
            Self::Event(_) | Self::Error(_) => None,
        }
    }
}

/// Boxed stream of agent items.
pub type AgentStream = Pin<Box<dyn Stream<Item = StreamAgentItem> + Send>>;

#[derive(Clone)]
enum SinkKind {
    /// Discards every event; used by non-streaming runs.
    Null,
    /// Forwards events into a bounded channel.
    Channel(mpsc::Sender<StreamAgentItem>),
}

/// Filtering, attributing event emitter handed to the run loop.
///
/// Each sink is scoped to one executing agent: it knows that agent's
/// manifest id, the direct invoker's manifest id (for sub-agent runs), and
/// the agent's configured event filter. Deriving a [`EventSink::child`]
/// sink for a sub-agent run shifts the attribution one level down while
/// sharing the channel and the sequence counter.
#[derive(Clone)]
pub struct EventSink {
    kind: SinkKind,
    manifest_id: AgentId,
    parent_manifest_id: Option<AgentId>,
    filter: Arc<HashSet<EventKind>>,
    sequence: Arc<AtomicU64>,
    on_closed: Option<CancellationToken>,
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("manifest_id", &self.manifest_id)
            .field("parent_manifest_id", &self.parent_manifest_id)
            .finish_non_exhaustive()
    }
}

impl EventSink {
    /// A sink that discards all events.
    #[must_use]
    pub fn null(manifest_id: AgentId) -> Self {
        Self {
            kind: SinkKind::Null,
            manifest_id,
            parent_manifest_id: None,
            filter: Arc::new(HashSet::new()),
            sequence: Arc::new(AtomicU64::new(0)),
            on_closed: None,
        }
    }

    /// A sink forwarding into a bounded channel.
    ///
    /// `on_closed` is tripped when the consumer side of the channel is
    /// dropped, propagating consumer cancellation into the run.
    #[must_use]
    pub fn channel(
        tx: mpsc::Sender<StreamAgentItem>,
        manifest_id: AgentId,
        filter: HashSet<EventKind>,
        on_closed: CancellationToken,
    ) -> Self {
        Self {
            kind: SinkKind::Channel(tx),
            manifest_id,
            parent_manifest_id: None,
            filter: Arc::new(filter),
            sequence: Arc::new(AtomicU64::new(0)),
            on_closed: Some(on_closed),
        }
    }

    /// Derive a sink for a sub-agent run.
    ///
    /// Events emitted through the child sink carry the child's manifest id
    /// and name this sink's agent as their parent; filtering follows the
    /// child manifest's configuration.
    #[must_use]
    pub fn child(&self, child_manifest_id: AgentId, child_filter: HashSet<EventKind>) -> Self {
        Self {
            kind: self.kind.clone(),
            parent_manifest_id: Some(self.manifest_id.clone()),
            manifest_id: child_manifest_id,
            filter: Arc::new(child_filter),
            sequence: Arc::clone(&self.sequence),
            on_closed: self.on_closed.clone(),
        }
    }

    /// Manifest id of the agent this sink is scoped to.
    #[must_use]
    pub const fn manifest_id(&self) -> &AgentId {
        &self.manifest_id
    }

    /// Emit an event, applying the filter and attribution.
    ///
    /// Blocks when the channel is full; never drops a passing event.
    pub async fn emit(&self, payload: EventPayload) {
        let kind = payload.kind();
        if kind.is_filterable() && !self.filter.contains(&kind) {
            return;
        }
        let event = AgentEvent {
            payload,
            manifest_id: self.manifest_id.clone(),
            parent_manifest_id: self.parent_manifest_id.clone(),
            timestamp: Utc::now(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
        };
        self.forward(StreamAgentItem::Event(event)).await;
    }

    /// Emit a non-terminal error item.
    pub async fn emit_error(&self, error: ErrorDetail) {
        self.forward(StreamAgentItem::Error(error)).await;
    }

    async fn forward(&self, item: StreamAgentItem) {
        match &self.kind {
            SinkKind::Null => {}
            SinkKind::Channel(tx) => {
                if tx.send(item).await.is_err() {
                    debug!(manifest_id = %self.manifest_id, "Event consumer gone; cancelling run");
                    if let Some(token) = &self.on_closed {
                        token.cancel();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::RunId;

    fn filter(kinds: &[EventKind]) -> HashSet<EventKind> {
        kinds.iter().copied().collect()
    }

    #[tokio::test]
    async fn null_sink_discards_silently() {
        let sink = EventSink::null(AgentId::new("a"));
        sink.emit(EventPayload::TextDelta {
            delta: "x".to_owned(),
        })
        .await;
    }

    #[tokio::test]
    async fn filterable_events_respect_the_filter() {
        let (tx, mut rx) = mpsc::channel(8);
        let sink = EventSink::channel(
            tx,
            AgentId::new("a"),
            filter(&[EventKind::TextDelta]),
            CancellationToken::new(),
        );

        sink.emit(EventPayload::TextDelta {
            delta: "hi".to_owned(),
        })
        .await;
        sink.emit(EventPayload::StepStart { step: 1 }).await;
        drop(sink);

        let mut kinds = Vec::new();
        while let Some(item) = rx.recv().await {
            if let StreamAgentItem::Event(event) = item {
                kinds.push(event.kind());
            }
        }
        assert_eq!(kinds, vec![EventKind::TextDelta]);
    }

    #[tokio::test]
    async fn lifecycle_events_bypass_the_filter() {
        let (tx, mut rx) = mpsc::channel(8);
        let sink = EventSink::channel(
            tx,
            AgentId::new("a"),
            HashSet::new(),
            CancellationToken::new(),
        );
        sink.emit(EventPayload::AgentDone {
            run_id: RunId::new("r1"),
        })
        .await;
        drop(sink);

        let item = rx.recv().await.expect("lifecycle event should pass");
        assert_eq!(
            item.as_event().map(AgentEvent::kind),
            Some(EventKind::AgentDone)
        );
    }

    #[tokio::test]
    async fn child_sink_tags_parent_and_shares_sequence() {
        let (tx, mut rx) = mpsc::channel(8);
        let root = EventSink::channel(
            tx,
            AgentId::new("root"),
            filter(&[EventKind::TextDelta]),
            CancellationToken::new(),
        );
        let leaf = root.child(AgentId::new("leaf"), filter(&[EventKind::TextDelta]));

        root.emit(EventPayload::TextDelta {
            delta: "r".to_owned(),
        })
        .await;
        leaf.emit(EventPayload::TextDelta {
            delta: "l".to_owned(),
        })
        .await;
        drop(root);
        drop(leaf);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let first = first.as_event().unwrap();
        let second = second.as_event().unwrap();
        assert_eq!(first.manifest_id, AgentId::new("root"));
        assert_eq!(first.parent_manifest_id, None);
        assert_eq!(second.manifest_id, AgentId::new("leaf"));
        assert_eq!(second.parent_manifest_id, Some(AgentId::new("root")));
        assert!(second.sequence > first.sequence);
    }

    #[tokio::test]
    async fn grandchild_parent_is_the_direct_invoker() {
        let (tx, _rx) = mpsc::channel(8);
        let root = EventSink::channel(
            tx,
            AgentId::new("root"),
            HashSet::new(),
            CancellationToken::new(),
        );
        let middle = root.child(AgentId::new("middle"), HashSet::new());
        let leaf = middle.child(AgentId::new("leaf"), HashSet::new());
        assert_eq!(leaf.parent_manifest_id, Some(AgentId::new("middle")));
        assert_eq!(middle.parent_manifest_id, Some(AgentId::new("root")));
    }

    #[tokio::test]
    async fn dropped_consumer_trips_the_token() {
        let (tx, rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let sink = EventSink::channel(tx, AgentId::new("a"), HashSet::new(), token.clone());
        drop(rx);

        sink.emit(EventPayload::AgentStarted {
            run_id: RunId::new("r1"),
        })
        .await;
        assert!(token.is_cancelled());
    }
}
