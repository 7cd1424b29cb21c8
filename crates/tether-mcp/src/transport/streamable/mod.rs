//! Streamable HTTP Transport
//!
//! The session-oriented bidirectional transport built from HTTP POST plus
//! Server-Sent Events: POST carries client-to-server frames and yields
//! either a JSON body or an SSE stream of responses; GET opens the single
//! server-initiated standalone stream; DELETE terminates the session.
//! Streams are resumable through an [`crate::transport::event_store::EventStore`]
//! and `Last-Event-ID`.

pub mod auth;
pub mod client;
pub mod config;
pub mod server;
pub(crate) mod session;

pub use auth::{AuthError, AuthOutcome, AuthProvider};
pub use client::StreamableHttpClientTransport;
pub use config::{ReconnectionOptions, StreamableHttpClientConfig, StreamableHttpServerConfig};
pub use server::{StreamableHttpHandler, StreamableHttpServerTransport};
