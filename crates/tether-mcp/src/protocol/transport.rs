//! Transport Abstractions
//!
//! Event-driven transport interface shared by every carrier in this crate.
//! A transport delivers inbound frames through a [`MessageHandler`] and
//! accepts outbound messages through [`Transport::send`]; the protocol
//! engine installs its handler with [`Transport::set_message_handler`] when
//! it attaches.
//!
//! # Ordering contract
//!
//! Within a single transport, messages reach `handle_message` in the order
//! the peer passed them to `send`. Across independent SSE streams of one
//! HTTP session no ordering is promised.
//!
//! # Examples
//!
//! ```rust
//! use tether_mcp::protocol::{JsonRpcMessage, MessageContext, MessageHandler, TransportError};
//! use async_trait::async_trait;
//!
//! struct EchoHandler;
//!
//! #[async_trait]
//! impl MessageHandler for EchoHandler {
//!     async fn handle_message(&self, message: JsonRpcMessage, _context: MessageContext) {
//!         println!("received: {message:?}");
//!     }
//!
//!     async fn handle_error(&self, error: TransportError) {
//!         eprintln!("transport error: {error}");
//!     }
//!
//!     async fn handle_close(&self) {
//!         println!("transport closed");
//!     }
//! }
//! ```

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::sync::Arc;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

// Layer 3: Internal module imports
use super::message::{JsonRpcMessage, RequestId};

/// Transport-level error type
///
/// Covers every failure a carrier can produce, from socket trouble to
/// session validation to oversized frames. Request-scoped JSON-RPC errors
/// are *not* transport errors; they travel inside response messages.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection-related errors (not started, already running, peer gone)
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// I/O operation errors
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Message serialization/deserialization errors
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    /// Protocol-level framing violations
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Session identity errors (missing, mismatched, or expired session)
    #[error("Session error: {message}")]
    Session { message: String },

    /// Unexpected HTTP status from the peer
    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    /// Authorization was required and could not be completed
    #[error("Unauthorized")]
    Unauthorized,

    /// A frame exceeded the configured size limit
    #[error("Message of {size} bytes exceeds limit of {max_size} bytes")]
    MessageTooLarge { size: usize, max_size: usize },

    /// Timeout while waiting on the carrier
    #[error("Timeout error: {message}")]
    Timeout { message: String },
}

impl TransportError {
    /// Convenience constructor for connection errors
    pub fn connection(message: impl Into<String>) -> Self {
        TransportError::Connection {
            message: message.into(),
        }
    }

    /// Convenience constructor for protocol framing errors
    pub fn protocol(message: impl Into<String>) -> Self {
        TransportError::Protocol {
            message: message.into(),
        }
    }

    /// Convenience constructor for session errors
    pub fn session(message: impl Into<String>) -> Self {
        TransportError::Session {
            message: message.into(),
        }
    }
}

/// Per-send carrier options
///
/// Most sends need none of these; the defaults mean "route normally".
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Server side: associate a request-less message (a notification or a
    /// server-initiated request) with the stream owned by this request id
    pub related_request_id: Option<RequestId>,

    /// Client side: resume a broken SSE stream instead of POSTing; the
    /// value is the last SSE event id observed on that stream
    pub resumption_token: Option<String>,
}

impl SendOptions {
    /// Options that relate the message to an in-flight request's stream
    pub fn related_to(request_id: RequestId) -> Self {
        Self {
            related_request_id: Some(request_id),
            ..Default::default()
        }
    }

    /// Options that resume a stream from a recorded event id
    pub fn resume_from(token: impl Into<String>) -> Self {
        Self {
            resumption_token: Some(token.into()),
            ..Default::default()
        }
    }
}

/// Context delivered alongside each inbound message
///
/// Carries the session identity, a receive timestamp, and transport
/// metadata. The streamable HTTP client records SSE resumption tokens
/// under [`MessageContext::LAST_EVENT_ID`] so the application can persist
/// them for later resumption.
#[derive(Debug, Clone)]
pub struct MessageContext<T = ()> {
    /// Session identifier (if the carrier has one)
    session_id: Option<String>,

    /// When the message was received
    timestamp: DateTime<Utc>,

    /// Additional transport metadata
    metadata: HashMap<String, String>,

    /// Transport-specific data
    transport_data: Option<T>,
}

impl<T> MessageContext<T> {
    /// Metadata key under which SSE resumption tokens are delivered
    pub const LAST_EVENT_ID: &'static str = super::constants::headers::LAST_EVENT_ID;

    /// Create a context bound to a session
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
            transport_data: None,
        }
    }

    /// Create a context without session identity
    pub fn without_session() -> Self {
        Self {
            session_id: None,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
            transport_data: None,
        }
    }

    /// Get the session ID
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Get the receive timestamp
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Get a metadata value
    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|s| s.as_str())
    }

    /// The SSE resumption token attached to this message, if any
    pub fn resumption_token(&self) -> Option<&str> {
        self.get_metadata(Self::LAST_EVENT_ID)
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attach transport-specific data
    pub fn with_transport_data(mut self, data: T) -> Self {
        self.transport_data = Some(data);
        self
    }

    /// Get transport-specific data
    pub fn transport_data(&self) -> Option<&T> {
        self.transport_data.as_ref()
    }
}

/// Event-driven message handler
///
/// Separates transport concerns (delivery) from protocol concerns (what a
/// message means). The generic parameter carries transport-specific context
/// data; every carrier in this crate uses the unit default.
#[async_trait]
pub trait MessageHandler<T = ()>: Send + Sync {
    /// Handle one inbound JSON-RPC message
    async fn handle_message(&self, message: JsonRpcMessage, context: MessageContext<T>);

    /// Handle a transport-level error that produced no message
    async fn handle_error(&self, error: TransportError);

    /// Handle transport closure; called exactly once per transport
    async fn handle_close(&self);
}

/// Event-driven transport interface
///
/// Lifecycle: configure a handler, `start()`, exchange messages, `close()`.
/// `close()` is idempotent and guarantees the handler's `handle_close`
/// fires exactly once, no matter how the transport ends.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport-specific error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Install the handler that receives inbound messages and events
    ///
    /// The protocol engine calls this when it attaches; installing a new
    /// handler replaces the previous one for messages not yet dispatched.
    fn set_message_handler(&mut self, handler: Arc<dyn MessageHandler>);

    /// Start delivering inbound messages; fails if already started
    async fn start(&mut self) -> Result<(), Self::Error>;

    /// Send a single message with default routing
    async fn send(&mut self, message: JsonRpcMessage) -> Result<(), Self::Error> {
        self.send_with_options(message, SendOptions::default())
            .await
    }

    /// Send a single message with carrier-specific options
    async fn send_with_options(
        &mut self,
        message: JsonRpcMessage,
        options: SendOptions,
    ) -> Result<(), Self::Error>;

    /// Close the transport and release resources
    async fn close(&mut self) -> Result<(), Self::Error>;

    /// Current session identifier, for session-based carriers
    fn session_id(&self) -> Option<String>;

    /// True while the transport can exchange messages
    fn is_connected(&self) -> bool;

    /// Static identifier for logging ("stdio", "streamable-http", ...)
    fn transport_type(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_metadata_and_session() {
        let context = MessageContext::<()>::new("session-1")
            .with_metadata(MessageContext::<()>::LAST_EVENT_ID, "stream_5");
        assert_eq!(context.session_id(), Some("session-1"));
        assert_eq!(context.resumption_token(), Some("stream_5"));
        assert!(context.get_metadata("missing").is_none());
    }

    #[test]
    fn send_options_constructors() {
        let related = SendOptions::related_to(RequestId::new_number(4));
        assert_eq!(related.related_request_id, Some(RequestId::new_number(4)));
        assert!(related.resumption_token.is_none());

        let resume = SendOptions::resume_from("ev-9");
        assert_eq!(resume.resumption_token.as_deref(), Some("ev-9"));
    }
}
