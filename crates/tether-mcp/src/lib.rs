//! Tether MCP - Model Context Protocol Transport & Protocol Runtime
//!
//! This crate provides the transport-and-protocol core of the Model Context
//! Protocol (MCP): a bidirectional JSON-RPC 2.0 runtime connecting clients
//! (LLM hosts) to servers (tool/resource providers) over pluggable
//! transports.
//!
//! # Architecture
//!
//! The implementation is organized in layers:
//!
//! - **Protocol Layer** (`protocol`): JSON-RPC 2.0 message model, wire
//!   validation, lifecycle types, and the [`protocol::Transport`] /
//!   [`protocol::MessageHandler`] abstraction
//! - **Transport Layer** (`transport`): the streamable HTTP transport
//!   (client and server), the child-process stdio transport, the in-memory
//!   pair, the incremental SSE decoder, and the event-store interface that
//!   makes streams resumable
//! - **Engine Layer** (`engine`): request/response correlation, progress
//!   routing, cancellation, timeouts, handler dispatch, and the
//!   initialization handshake
//!
//! # Quick Start
//!
//! ```rust
//! use tether_mcp::protocol::{JsonRpcRequest, RequestId, WireFormat};
//! use serde_json::json;
//!
//! let request = JsonRpcRequest::new(
//!     "ping",
//!     Some(json!({"message": "hello world"})),
//!     RequestId::new_string("req-001"),
//! );
//!
//! let json = request.to_json().unwrap();
//! let parsed = JsonRpcRequest::from_json(&json).unwrap();
//! assert_eq!(request, parsed);
//! ```
//!
//! # Connecting an engine over the in-memory pair
//!
//! ```rust
//! use std::sync::Arc;
//! use tether_mcp::engine::{EngineOptions, ProtocolEngine};
//! use tether_mcp::transport::in_memory::InMemoryTransport;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (client_end, server_end) = InMemoryTransport::pair();
//!
//! let server = ProtocolEngine::<InMemoryTransport>::builder()
//!     .request_handler_fn("echo", |request, _cx| async move {
//!         Ok(request.params.unwrap_or_default())
//!     })
//!     .connect(server_end, EngineOptions::default())
//!     .await?;
//!
//! let client = ProtocolEngine::<InMemoryTransport>::builder()
//!     .connect(client_end, EngineOptions::default())
//!     .await?;
//!
//! let reply = client
//!     .request("echo", Some(serde_json::json!({"hello": "world"})), Default::default())
//!     .await?;
//! assert_eq!(reply, serde_json::json!({"hello": "world"}));
//!
//! client.close().await?;
//! server.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod protocol;
pub mod transport;

// Convenience re-exports of the types nearly every consumer touches
pub use engine::{EngineError, EngineOptions, ProtocolEngine, RequestOptions};
pub use protocol::{
    JsonRpcError, JsonRpcFrame, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, McpError, MessageContext, MessageHandler, RequestId, SendOptions, Transport,
    TransportError, WireFormat,
};
