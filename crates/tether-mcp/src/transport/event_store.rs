//! Event Store Interface for Resumable Streams
//!
//! When the streamable HTTP server is configured with an event store, every
//! SSE event is persisted before it is written to the wire, and a client
//! that reconnects with `Last-Event-ID` gets the tail of its stream
//! replayed. The store is deliberately small: two operations and one
//! invariant — the stream identity must be recoverable from an event id.

// Layer 1: Standard library imports
use std::collections::VecDeque;
use std::sync::Arc;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

// Layer 3: Internal module imports
use crate::protocol::{defaults, JsonRpcMessage, TransportError};

/// Event store failure modes
#[derive(Error, Debug)]
pub enum EventStoreError {
    /// The event id is not in the `<stream>_<sequence>` shape
    #[error("Invalid event id: {id}")]
    InvalidEventId { id: String },

    /// The event id names a stream this store has never seen
    #[error("Unknown stream for event id: {id}")]
    UnknownEventId { id: String },

    /// Events after the given id were evicted; an ordered replay is no
    /// longer possible
    #[error("Events after {id} have been evicted from stream {stream_id}")]
    EventsEvicted { stream_id: String, id: String },

    /// The replay sink refused an event (usually: client went away)
    #[error("Replay delivery failed: {source}")]
    Delivery {
        #[from]
        source: TransportError,
    },
}

/// Receiver for replayed events
///
/// The server passes a sink wrapping the reconnected response stream;
/// `emit` is called once per replayed event, in stream order.
#[async_trait]
pub trait EventSink: Send {
    /// Deliver one replayed event
    async fn emit(&mut self, event_id: &str, message: &JsonRpcMessage)
        -> Result<(), TransportError>;
}

/// Per-stream event persistence with ordered replay
///
/// Event ids generated by a store must embed the stream identity so that
/// `replay_events_after` can recover which stream a reconnecting client
/// was consuming from the id alone.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist one event; returns the generated event id
    async fn store_event(
        &self,
        stream_id: &str,
        message: &JsonRpcMessage,
    ) -> Result<String, EventStoreError>;

    /// Replay every event strictly after `last_event_id` on that event's
    /// stream, in order, through `sink`; returns the stream id
    async fn replay_events_after(
        &self,
        last_event_id: &str,
        sink: &mut dyn EventSink,
    ) -> Result<String, EventStoreError>;
}

/// Split a generated event id into its stream id and sequence number
fn split_event_id(event_id: &str) -> Result<(&str, u64), EventStoreError> {
    let (stream_id, sequence) =
        event_id
            .rsplit_once('_')
            .ok_or_else(|| EventStoreError::InvalidEventId {
                id: event_id.to_string(),
            })?;
    let sequence = sequence
        .parse::<u64>()
        .map_err(|_| EventStoreError::InvalidEventId {
            id: event_id.to_string(),
        })?;
    Ok((stream_id, sequence))
}

/// Events retained for one stream
struct StreamEvents {
    /// Sequence number the next event will receive
    next_sequence: u64,
    /// Highest sequence number evicted by the capacity bound (0 = none)
    evicted_through: u64,
    /// Retained `(sequence, message)` pairs, oldest first
    events: VecDeque<(u64, JsonRpcMessage)>,
}

/// In-memory [`EventStore`] with a per-stream capacity bound
///
/// Overflow policy: when a stream exceeds its capacity the oldest events
/// are evicted first. A replay that would have to cross the evicted gap
/// fails with [`EventStoreError::EventsEvicted`] rather than silently
/// skipping messages.
///
/// # Examples
///
/// ```rust
/// use tether_mcp::transport::event_store::{EventStore, InMemoryEventStore};
/// use tether_mcp::protocol::JsonRpcMessage;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = InMemoryEventStore::new();
/// let id = store
///     .store_event("s1", &JsonRpcMessage::notification("x", None))
///     .await
///     .unwrap();
/// assert_eq!(id, "s1_1");
/// # }
/// ```
pub struct InMemoryEventStore {
    streams: DashMap<String, StreamEvents>,
    max_events_per_stream: usize,
}

impl InMemoryEventStore {
    /// Create a store with the default per-stream capacity
    pub fn new() -> Self {
        Self::with_capacity(defaults::EVENT_STORE_CAPACITY)
    }

    /// Create a store retaining at most `max_events_per_stream` events
    pub fn with_capacity(max_events_per_stream: usize) -> Self {
        Self {
            streams: DashMap::new(),
            max_events_per_stream: max_events_per_stream.max(1),
        }
    }

    /// Wrap in the `Arc` the server transport configuration expects
    pub fn shared(self) -> Arc<dyn EventStore> {
        Arc::new(self)
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn store_event(
        &self,
        stream_id: &str,
        message: &JsonRpcMessage,
    ) -> Result<String, EventStoreError> {
        let mut stream = self
            .streams
            .entry(stream_id.to_string())
            .or_insert_with(|| StreamEvents {
                next_sequence: 1,
                evicted_through: 0,
                events: VecDeque::new(),
            });

        let sequence = stream.next_sequence;
        stream.next_sequence += 1;
        stream.events.push_back((sequence, message.clone()));
        while stream.events.len() > self.max_events_per_stream {
            if let Some((evicted, _)) = stream.events.pop_front() {
                stream.evicted_through = evicted;
            }
        }

        Ok(format!("{stream_id}_{sequence}"))
    }

    async fn replay_events_after(
        &self,
        last_event_id: &str,
        sink: &mut dyn EventSink,
    ) -> Result<String, EventStoreError> {
        let (stream_id, last_sequence) = split_event_id(last_event_id)?;

        // Clone the tail out of the map before any await: sinks suspend and
        // dashmap guards must not be held across suspension points.
        let tail: Vec<(u64, JsonRpcMessage)> = {
            let stream =
                self.streams
                    .get(stream_id)
                    .ok_or_else(|| EventStoreError::UnknownEventId {
                        id: last_event_id.to_string(),
                    })?;
            if last_sequence < stream.evicted_through {
                return Err(EventStoreError::EventsEvicted {
                    stream_id: stream_id.to_string(),
                    id: last_event_id.to_string(),
                });
            }
            stream
                .events
                .iter()
                .filter(|(sequence, _)| *sequence > last_sequence)
                .cloned()
                .collect()
        };

        debug!(
            stream_id,
            after = last_sequence,
            count = tail.len(),
            "replaying stored events"
        );
        for (sequence, message) in &tail {
            let event_id = format!("{stream_id}_{sequence}");
            sink.emit(&event_id, message).await?;
        }

        Ok(stream_id.to_string())
    }
}
