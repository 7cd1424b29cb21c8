//! Server-Side Stream Registry
//!
//! Bookkeeping for one streamable HTTP session: which SSE/JSON response
//! writer owns which request ids, which responses have already been
//! produced, and the single standalone stream slot. Every map here is
//! touched concurrently by `handle_request` tasks, by `send` calls from
//! the application, and by disconnect watchers, so registration, lookup,
//! and removal are individually atomic and completion is decided by a
//! single winner (the `remove` that takes the stream's request set).

// Layer 1: Standard library imports
use std::sync::Arc;

// Layer 2: Third-party crate imports
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::trace;

// Layer 3: Internal module imports
use crate::protocol::{JsonRpcMessage, RequestId};

/// Fixed stream id of the standalone (GET-opened) stream
///
/// A constant id keeps the standalone stream resumable: its event-store
/// records survive reconnects because every incarnation shares the id.
pub(crate) const STANDALONE_STREAM_ID: &str = "standalone";

/// One frame queued for an SSE response writer
#[derive(Debug)]
pub(crate) struct SseFrame {
    pub event_id: Option<String>,
    pub message: JsonRpcMessage,
}

/// The live writer behind a registered stream
pub(crate) enum StreamWriter {
    /// An open SSE response; dropping the sender ends the response body
    Sse { tx: mpsc::Sender<SseFrame> },
    /// A deferred JSON response waiting for every owned request to answer
    Json {
        reply: Mutex<Option<oneshot::Sender<Vec<JsonRpcMessage>>>>,
        expects_batch: bool,
    },
}

/// A stream whose every owning request has now been answered
pub(crate) struct CompletedStream {
    /// Buffered responses in the order the requests arrived
    pub responses: Vec<JsonRpcMessage>,
}

/// Registry of live streams and request ownership for one session
#[derive(Default)]
pub(crate) struct StreamRegistry {
    /// Stream id -> live response writer
    live: DashMap<String, Arc<StreamWriter>>,
    /// Request id -> owning stream id
    request_to_stream: DashMap<RequestId, String>,
    /// Stream id -> the full ordered set of request ids it owns
    stream_requests: DashMap<String, Vec<RequestId>>,
    /// Request id -> buffered response
    responses: DashMap<RequestId, JsonRpcMessage>,
}

impl StreamRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// True when any of `ids` is already owned by an open stream
    pub(crate) fn any_request_registered(&self, ids: &[RequestId]) -> bool {
        ids.iter().any(|id| self.request_to_stream.contains_key(id))
    }

    /// Register an SSE stream owning `request_ids`
    pub(crate) fn register_sse_stream(
        &self,
        stream_id: &str,
        tx: mpsc::Sender<SseFrame>,
        request_ids: Vec<RequestId>,
    ) {
        self.register_requests(stream_id, request_ids);
        self.live
            .insert(stream_id.to_string(), Arc::new(StreamWriter::Sse { tx }));
    }

    /// Register a deferred-JSON stream owning `request_ids`
    pub(crate) fn register_json_stream(
        &self,
        stream_id: &str,
        reply: oneshot::Sender<Vec<JsonRpcMessage>>,
        request_ids: Vec<RequestId>,
        expects_batch: bool,
    ) {
        self.register_requests(stream_id, request_ids);
        self.live.insert(
            stream_id.to_string(),
            Arc::new(StreamWriter::Json {
                reply: Mutex::new(Some(reply)),
                expects_batch,
            }),
        );
    }

    fn register_requests(&self, stream_id: &str, request_ids: Vec<RequestId>) {
        for id in &request_ids {
            self.request_to_stream
                .insert(id.clone(), stream_id.to_string());
        }
        self.stream_requests
            .insert(stream_id.to_string(), request_ids);
    }

    /// Claim the standalone slot; false when one is already open
    pub(crate) fn register_standalone(&self, tx: mpsc::Sender<SseFrame>) -> bool {
        if self.live.contains_key(STANDALONE_STREAM_ID) {
            return false;
        }
        self.live.insert(
            STANDALONE_STREAM_ID.to_string(),
            Arc::new(StreamWriter::Sse { tx }),
        );
        true
    }

    /// Re-attach a replayed stream to a fresh SSE writer
    pub(crate) fn reattach(&self, stream_id: &str, tx: mpsc::Sender<SseFrame>) {
        trace!(stream_id, "re-attaching resumed stream");
        self.live
            .insert(stream_id.to_string(), Arc::new(StreamWriter::Sse { tx }));
    }

    /// The live writer for a stream, if the peer is still connected
    pub(crate) fn writer(&self, stream_id: &str) -> Option<Arc<StreamWriter>> {
        self.live.get(stream_id).map(|entry| Arc::clone(entry.value()))
    }

    /// The stream owning a request id
    pub(crate) fn stream_for_request(&self, id: &RequestId) -> Option<String> {
        self.request_to_stream
            .get(id)
            .map(|entry| entry.value().clone())
    }

    /// Record a response for `id`; returns the completed stream when this
    /// was the last outstanding request on it
    ///
    /// Exactly one caller observes the completion: whoever wins the
    /// `stream_requests` removal.
    pub(crate) fn record_response(
        &self,
        id: &RequestId,
        message: JsonRpcMessage,
    ) -> Option<CompletedStream> {
        let stream_id = self.stream_for_request(id)?;
        self.responses.insert(id.clone(), message);

        let all_answered = self
            .stream_requests
            .get(&stream_id)
            .map(|owners| owners.iter().all(|rid| self.responses.contains_key(rid)))
            .unwrap_or(false);
        if !all_answered {
            return None;
        }

        let (_, owners) = self.stream_requests.remove(&stream_id)?;
        let mut ordered = Vec::with_capacity(owners.len());
        for rid in &owners {
            self.request_to_stream.remove(rid);
            if let Some((_, response)) = self.responses.remove(rid) {
                ordered.push(response);
            }
        }
        Some(CompletedStream { responses: ordered })
    }

    /// Drop the live writer for a stream (ends an SSE response)
    pub(crate) fn remove_live(&self, stream_id: &str) {
        self.live.remove(stream_id);
    }

    /// Handle a peer disconnect observed by the response writer
    ///
    /// Resumable sessions keep the request ownership maps so a replayed
    /// stream continues to receive its outstanding responses; without an
    /// event store the dangling registrations are removed outright.
    pub(crate) fn on_disconnect(&self, stream_id: &str, resumable: bool) {
        self.live.remove(stream_id);
        if resumable {
            return;
        }
        if let Some((_, owners)) = self.stream_requests.remove(stream_id) {
            for rid in owners {
                self.request_to_stream.remove(&rid);
                self.responses.remove(&rid);
            }
        }
    }

    /// Close every stream and clear all bookkeeping
    pub(crate) fn close_all(&self) {
        self.live.clear();
        self.request_to_stream.clear();
        self.stream_requests.clear();
        self.responses.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(id: i64) -> JsonRpcMessage {
        JsonRpcMessage::response(json!({"n": id}), RequestId::new_number(id))
    }

    #[tokio::test]
    async fn completion_fires_once_after_every_owner_answers() {
        let registry = StreamRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let ids = vec![RequestId::new_number(1), RequestId::new_number(2)];
        registry.register_sse_stream("s1", tx, ids.clone());

        assert!(registry
            .record_response(&ids[0], response(1))
            .is_none());
        let completed = registry
            .record_response(&ids[1], response(2))
            .expect("second response completes the stream");
        assert_eq!(completed.responses.len(), 2);

        // Ownership maps are gone.
        assert!(registry.stream_for_request(&ids[0]).is_none());
        assert!(registry.record_response(&ids[1], response(2)).is_none());
    }

    #[tokio::test]
    async fn standalone_slot_admits_exactly_one_stream() {
        let registry = StreamRegistry::new();
        let (tx_a, _rx_a) = mpsc::channel(1);
        let (tx_b, _rx_b) = mpsc::channel(1);
        assert!(registry.register_standalone(tx_a));
        assert!(!registry.register_standalone(tx_b));
        registry.remove_live(STANDALONE_STREAM_ID);
        let (tx_c, _rx_c) = mpsc::channel(1);
        assert!(registry.register_standalone(tx_c));
    }

    #[tokio::test]
    async fn disconnect_keeps_mappings_only_when_resumable() {
        let registry = StreamRegistry::new();
        let id = RequestId::new_number(9);

        let (tx, _rx) = mpsc::channel(1);
        registry.register_sse_stream("r", tx, vec![id.clone()]);
        registry.on_disconnect("r", true);
        assert_eq!(registry.stream_for_request(&id).as_deref(), Some("r"));
        assert!(registry.writer("r").is_none());

        let (tx, _rx) = mpsc::channel(1);
        registry.register_sse_stream("n", tx, vec![RequestId::new_number(10)]);
        registry.on_disconnect("n", false);
        assert!(registry
            .stream_for_request(&RequestId::new_number(10))
            .is_none());
    }
}
