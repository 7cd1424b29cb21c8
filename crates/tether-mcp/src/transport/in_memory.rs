//! In-Memory Transport Implementation
//!
//! A linked pair of transports sharing cross-references, used to wire a
//! client engine directly to a server engine inside one process. Delivery
//! is synchronous when the receiving end has started and buffered until
//! `start()` otherwise, which keeps tests fully deterministic: any
//! reordering here would break the ordering properties the other
//! transports are tested against.

// Layer 1: Standard library imports
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::trace;

// Layer 3: Internal module imports
use crate::protocol::{
    JsonRpcMessage, MessageContext, MessageHandler, SendOptions, Transport, TransportError,
};

/// State of one end of the pair
struct EndState {
    /// Handler receiving this end's inbound messages
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    /// Messages sent to this end before it started
    pending: std::sync::Mutex<VecDeque<JsonRpcMessage>>,
    /// Serializes deliveries to this end so buffered and live messages
    /// cannot interleave out of order
    dispatch: Mutex<()>,
    started: AtomicBool,
    closed: AtomicBool,
    close_notified: AtomicBool,
}

impl EndState {
    fn new() -> Self {
        Self {
            handler: RwLock::new(None),
            pending: std::sync::Mutex::new(VecDeque::new()),
            dispatch: Mutex::new(()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_notified: AtomicBool::new(false),
        }
    }

    fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn push_pending(&self, message: JsonRpcMessage) {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(message);
    }

    fn pop_pending(&self) -> Option<JsonRpcMessage> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }

    /// Fire `handle_close` at most once for this end
    async fn notify_close(&self) {
        if self.close_notified.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handler) = self.handler() {
            handler.handle_close().await;
        }
    }
}

/// One end of an in-memory transport pair
///
/// Construct with [`InMemoryTransport::pair`]; the two returned ends are
/// permanently linked and `close()` on either end closes both.
///
/// # Examples
///
/// ```rust
/// use tether_mcp::transport::in_memory::InMemoryTransport;
/// use tether_mcp::protocol::Transport;
///
/// let (client_end, server_end) = InMemoryTransport::pair();
/// assert_eq!(client_end.transport_type(), "in-memory");
/// assert!(!server_end.is_connected());
/// ```
pub struct InMemoryTransport {
    local: Arc<EndState>,
    remote: Arc<EndState>,
}

impl InMemoryTransport {
    /// Create a linked pair of transports
    pub fn pair() -> (InMemoryTransport, InMemoryTransport) {
        let a = Arc::new(EndState::new());
        let b = Arc::new(EndState::new());
        (
            InMemoryTransport {
                local: Arc::clone(&a),
                remote: Arc::clone(&b),
            },
            InMemoryTransport {
                local: b,
                remote: a,
            },
        )
    }

    async fn deliver_to_remote(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        if self.local.closed.load(Ordering::Acquire) {
            return Err(TransportError::connection("transport closed"));
        }
        if self.remote.closed.load(Ordering::Acquire) {
            return Err(TransportError::connection("peer transport closed"));
        }

        // Holding the remote dispatch lock keeps this delivery ordered
        // against the drain performed by the remote's start().
        let _dispatch = self.remote.dispatch.lock().await;
        if self.remote.started.load(Ordering::Acquire) {
            if let Some(handler) = self.remote.handler() {
                handler
                    .handle_message(message, MessageContext::without_session())
                    .await;
            }
        } else {
            trace!("peer not started, buffering message");
            self.remote.push_pending(message);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    type Error = TransportError;

    fn set_message_handler(&mut self, handler: Arc<dyn MessageHandler>) {
        *self
            .local
            .handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handler);
    }

    async fn start(&mut self) -> Result<(), Self::Error> {
        if self.local.closed.load(Ordering::Acquire) {
            return Err(TransportError::connection("transport closed"));
        }
        if self.local.started.load(Ordering::Acquire) {
            return Err(TransportError::connection("transport already started"));
        }
        let handler = self
            .local
            .handler()
            .ok_or_else(|| TransportError::connection("no message handler configured"))?;

        let _dispatch = self.local.dispatch.lock().await;
        self.local.started.store(true, Ordering::Release);
        while let Some(message) = self.local.pop_pending() {
            handler
                .handle_message(message, MessageContext::without_session())
                .await;
        }
        Ok(())
    }

    async fn send_with_options(
        &mut self,
        message: JsonRpcMessage,
        _options: SendOptions,
    ) -> Result<(), Self::Error> {
        self.deliver_to_remote(message).await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        // Closing either end closes both.
        self.local.closed.store(true, Ordering::Release);
        self.remote.closed.store(true, Ordering::Release);
        self.local.notify_close().await;
        self.remote.notify_close().await;
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        None
    }

    fn is_connected(&self) -> bool {
        self.local.started.load(Ordering::Acquire) && !self.local.closed.load(Ordering::Acquire)
    }

    fn transport_type(&self) -> &'static str {
        "in-memory"
    }
}
