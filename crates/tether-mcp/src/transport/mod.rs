//! Transport Layer
//!
//! Concrete carriers for the [`crate::protocol::Transport`] abstraction:
//! the streamable HTTP transport (client and server), the child-process
//! stdio transport, and the in-memory pair for same-process wiring, plus
//! the incremental SSE decoder and the event-store interface the HTTP
//! transport builds resumability on.

pub mod event_store;
pub mod in_memory;
pub mod sse;
pub mod stdio;
pub mod streamable;

pub use event_store::{EventSink, EventStore, EventStoreError, InMemoryEventStore};
pub use in_memory::InMemoryTransport;
pub use sse::{SseEvent, SseParser};
pub use stdio::{StdioClientConfig, StdioClientTransport, StdioTransport, StdioTransportBuilder};
pub use streamable::{
    AuthError, AuthOutcome, AuthProvider, ReconnectionOptions, StreamableHttpClientConfig,
    StreamableHttpClientTransport, StreamableHttpHandler, StreamableHttpServerConfig,
    StreamableHttpServerTransport,
};
