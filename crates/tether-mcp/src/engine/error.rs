//! Engine Error Types
//!
//! The terminal outcomes a caller of [`super::ProtocolEngine::request`]
//! can observe. Exactly one of these (or a success) resolves every
//! outbound request.

// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use thiserror::Error;

// Layer 3: Internal module imports
use crate::protocol::{error_codes, McpError};

/// Errors produced by the protocol engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine has no live transport
    #[error("Not connected")]
    NotConnected,

    /// The transport closed while the request was in flight
    #[error("Connection closed")]
    ConnectionClosed,

    /// The per-request timeout elapsed
    #[error("Request timed out: {method}")]
    RequestTimeout { method: String },

    /// The caller's cancellation signal fired
    #[error("Request cancelled: {}", .reason.as_deref().unwrap_or("no reason given"))]
    Cancelled { reason: Option<String> },

    /// The peer answered with a JSON-RPC error, or a local protocol rule
    /// rejected the request before it was sent
    #[error(transparent)]
    Protocol(#[from] McpError),

    /// The transport failed to carry the message
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Initialization failed because the server chose a protocol version
    /// this client does not speak
    #[error("Unsupported protocol version: {version}")]
    UnsupportedProtocolVersion { version: String },

    /// Local serialization failure building a frame
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl EngineError {
    /// The JSON-RPC code associated with this outcome, where one exists
    pub fn json_rpc_code(&self) -> Option<i32> {
        match self {
            EngineError::ConnectionClosed => Some(error_codes::CONNECTION_CLOSED),
            EngineError::Protocol(error) => Some(error.code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_closed_maps_to_minus_one() {
        assert_eq!(EngineError::ConnectionClosed.json_rpc_code(), Some(-1));
    }

    #[test]
    fn protocol_errors_expose_their_wire_code() {
        let error = EngineError::Protocol(McpError::method_not_found("x"));
        assert_eq!(error.json_rpc_code(), Some(-32601));
    }

    #[test]
    fn cancelled_display_includes_reason() {
        let error = EngineError::Cancelled {
            reason: Some("user".to_string()),
        };
        assert!(error.to_string().contains("user"));
    }
}
