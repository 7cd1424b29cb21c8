//! Protocol Error Types
//!
//! Error types shared by the message model and the protocol engine: wire
//! validation failures with their JSON-RPC codes, and the [`McpError`]
//! shape used when a peer answers a request with an error object.

// Layer 1: Standard library imports
use std::fmt;

// Layer 2: Third-party crate imports
use serde_json::Value;
use thiserror::Error;

// Layer 3: Internal module imports
use super::constants::error_codes;
use super::message::JsonRpcError;

/// Validation failure while parsing a wire frame
///
/// Distinguishes malformed JSON (-32700) from structurally invalid
/// messages (-32600) so HTTP handlers can build the right error body.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MessageError {
    /// The bytes were not valid JSON
    #[error("Parse error: {message}")]
    Parse { message: String },

    /// The JSON did not have the shape of a JSON-RPC 2.0 message
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },
}

impl MessageError {
    /// The JSON-RPC error code this failure maps to on the wire
    pub fn json_rpc_code(&self) -> i32 {
        match self {
            MessageError::Parse { .. } => error_codes::PARSE_ERROR,
            MessageError::InvalidRequest { .. } => error_codes::INVALID_REQUEST,
        }
    }

    /// Build the JSON-RPC error object for this failure
    pub fn to_error_object(&self) -> JsonRpcError {
        match self {
            MessageError::Parse { message } => JsonRpcError::new(
                error_codes::PARSE_ERROR,
                "Parse error",
                Some(Value::String(message.clone())),
            ),
            MessageError::InvalidRequest { message } => JsonRpcError::new(
                error_codes::INVALID_REQUEST,
                "Invalid Request",
                Some(Value::String(message.clone())),
            ),
        }
    }
}

/// An error answered by the remote peer, or raised locally with a wire code
///
/// Wraps the JSON-RPC error object so callers can match on `code` and
/// inspect `data` without re-parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct McpError {
    /// JSON-RPC error code
    pub code: i32,
    /// Short error description
    pub message: String,
    /// Optional structured detail
    pub data: Option<Value>,
}

impl McpError {
    /// Create an error with an explicit code
    pub fn new(code: i32, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    /// Method-not-found (-32601)
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
            None,
        )
    }

    /// Invalid params (-32602)
    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, detail, None)
    }

    /// Internal error (-32603)
    pub fn internal_error(detail: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, detail, None)
    }

    /// Invalid request (-32600)
    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_REQUEST, detail, None)
    }
}

impl fmt::Display for McpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MCP error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for McpError {}

impl From<JsonRpcError> for McpError {
    fn from(error: JsonRpcError) -> Self {
        Self {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

impl From<McpError> for JsonRpcError {
    fn from(error: McpError) -> Self {
        JsonRpcError::new(error.code, error.message, error.data)
    }
}
