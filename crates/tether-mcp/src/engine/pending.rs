//! Pending-Request Bookkeeping
//!
//! Single-assignment waiters for in-flight outbound requests plus the
//! monotonic id generator that guarantees an id is never reused while a
//! request is in flight.

// Layer 1: Standard library imports
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

// Layer 2: Third-party crate imports
use serde_json::Value;
use tokio::sync::{oneshot, watch};

// Layer 3: Internal module imports
use crate::protocol::{McpError, ProgressParams, RequestId};

/// Callback invoked for each progress notification routed to a request
pub type ProgressCallback = Arc<dyn Fn(ProgressParams) + Send + Sync>;

/// Waiter for one outbound request
///
/// The `oneshot` sender enforces the single-resolution contract: success,
/// error, timeout, cancellation and connection-closed all race for the
/// one completion, and dropping the sender is how "connection closed"
/// reaches the waiting caller.
pub(crate) struct PendingRequest {
    pub responder: oneshot::Sender<Result<Value, McpError>>,
}

/// Progress routing state for one outbound request
pub(crate) struct ProgressEntry {
    /// Caller callback, when one was supplied
    pub callback: Option<ProgressCallback>,
    /// Ticks the request's timeout-reset loop
    pub tick: watch::Sender<()>,
}

/// Monotonic outbound request-id generator
#[derive(Debug, Default)]
pub(crate) struct RequestIdGenerator {
    counter: AtomicI64,
}

impl RequestIdGenerator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next(&self) -> RequestId {
        RequestId::Number(self.counter.fetch_add(1, Ordering::AcqRel))
    }
}
