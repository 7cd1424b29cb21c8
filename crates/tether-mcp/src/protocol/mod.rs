//! Protocol Layer
//!
//! JSON-RPC 2.0 message model, wire validation, lifecycle types, and the
//! transport abstraction every carrier implements.

pub mod constants;
pub mod errors;
pub mod message;
pub mod transport;
pub mod types;

// Re-export the protocol surface at the module root
pub use constants::{defaults, error_codes, headers, methods, protocol_versions};
pub use errors::{McpError, MessageError};
pub use message::{
    JsonRpcError, JsonRpcFrame, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId, WireFormat, JSONRPC_VERSION,
};
pub use transport::{MessageContext, MessageHandler, SendOptions, Transport, TransportError};
pub use types::{
    CancelledParams, ClientCapabilities, Implementation, InitializeParams, InitializeResult,
    ProgressParams, PromptsCapability, ProtocolVersion, ResourcesCapability, RootsCapability,
    ServerCapabilities, ToolsCapability,
};
