//! JSON-RPC 2.0 Message Implementation
//!
//! This module provides the JSON-RPC 2.0 message types used by every
//! transport and by the protocol engine, with shared serialization behavior
//! through the [`WireFormat`] trait.
//!
//! # Architecture
//!
//! - Core message types ([`JsonRpcRequest`], [`JsonRpcResponse`],
//!   [`JsonRpcNotification`]) unified under [`JsonRpcMessage`]
//! - [`JsonRpcFrame`] for whole wire frames (a single message or a batch)
//! - Key-driven classification: an incoming value is classified by which of
//!   `method`/`id`/`result`/`error` it carries, so a notification can never
//!   be mistaken for a response
//!
//! # Examples
//!
//! ```rust
//! use tether_mcp::protocol::{JsonRpcRequest, RequestId, WireFormat};
//! use serde_json::json;
//!
//! let request = JsonRpcRequest::new(
//!     "ping",
//!     Some(json!({"message": "hello"})),
//!     RequestId::new_string("req-123"),
//! );
//!
//! let json = request.to_json().unwrap();
//! let parsed = JsonRpcRequest::from_json(&json).unwrap();
//! assert_eq!(request, parsed);
//! ```

// Layer 1: Standard library imports
use std::fmt;

// Layer 2: Third-party crate imports
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// Layer 3: Internal module imports
use super::constants::error_codes;
use super::errors::MessageError;

/// The only protocol version string JSON-RPC 2.0 permits.
pub const JSONRPC_VERSION: &str = "2.0";

/// Trait for JSON-RPC wire serialization and deserialization
///
/// Provides the common conversion surface for all message types so that
/// transports serialize consistently. Any `Serialize + Deserialize` type
/// gets the default implementations for free.
pub trait WireFormat: Serialize + for<'de> Deserialize<'de> {
    /// Serialize this value to a JSON string
    fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from a JSON string
    fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize directly into a reusable buffer, avoiding the intermediate
    /// `String` allocation
    fn serialize_to_buffer(&self, buffer: &mut BytesMut) -> Result<(), serde_json::Error> {
        serde_json::to_writer(buffer.writer(), self)
    }

    /// Serialize this value to bytes ready for a transport
    fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        let mut buffer = BytesMut::with_capacity(256);
        self.serialize_to_buffer(&mut buffer)?;
        Ok(buffer.freeze())
    }

    /// Deserialize from JSON bytes
    fn from_json_bytes(json: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(json)
    }
}

/// Request ID supporting both string and numeric formats
///
/// JSON-RPC 2.0 allows request IDs to be strings, numbers, or null. This
/// enum covers the string and numeric variants; a null ID (legal only on
/// error responses to unparseable requests) is `Option<RequestId>`.
///
/// Equality is by value within the variant: numbers compare as numbers,
/// strings as strings. `RequestId::Number(1)` never equals
/// `RequestId::String("1")`.
///
/// # Examples
///
/// ```rust
/// use tether_mcp::protocol::RequestId;
///
/// let string_id = RequestId::new_string("req-123");
/// let numeric_id = RequestId::new_number(42);
///
/// assert_eq!(serde_json::to_string(&string_id).unwrap(), r#""req-123""#);
/// assert_eq!(serde_json::to_string(&numeric_id).unwrap(), "42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// String-based request identifier
    String(String),
    /// Numeric request identifier
    Number(i64),
}

impl RequestId {
    /// Create a new string-based request ID
    pub fn new_string(id: impl Into<String>) -> Self {
        RequestId::String(id.into())
    }

    /// Create a new numeric request ID
    pub fn new_number(id: i64) -> Self {
        RequestId::Number(id)
    }

    /// Interpret a JSON value as a request ID
    ///
    /// Accepts strings and integers; everything else (floats, booleans,
    /// null, containers) is rejected, matching the wire validation rules.
    pub fn from_value(value: &Value) -> Result<Self, MessageError> {
        match value {
            Value::String(s) => Ok(RequestId::String(s.clone())),
            Value::Number(n) => n.as_i64().map(RequestId::Number).ok_or_else(|| {
                MessageError::InvalidRequest {
                    message: format!("request id must be an integer or string, got {n}"),
                }
            }),
            other => Err(MessageError::InvalidRequest {
                message: format!("request id must be an integer or string, got {other}"),
            }),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::String(s) => write!(f, "{s}"),
            RequestId::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

/// JSON-RPC 2.0 error object carried by error responses
///
/// # Examples
///
/// ```rust
/// use tether_mcp::protocol::JsonRpcError;
///
/// let error = JsonRpcError::method_not_found("resources/list");
/// assert_eq!(error.code, -32601);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Numeric error code (reserved JSON-RPC range or MCP-specific)
    pub code: i32,

    /// Short human-readable error description
    pub message: String,

    /// Optional structured diagnostic payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Create an error object with an arbitrary code
    pub fn new(code: i32, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    /// Parse error (-32700)
    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::new(
            error_codes::PARSE_ERROR,
            "Parse error",
            Some(Value::String(detail.into())),
        )
    }

    /// Invalid request (-32600)
    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(
            error_codes::INVALID_REQUEST,
            "Invalid Request",
            Some(Value::String(detail.into())),
        )
    }

    /// Method not found (-32601)
    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            "Method not found",
            Some(Value::String(method.into())),
        )
    }

    /// Invalid params (-32602)
    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(
            error_codes::INVALID_PARAMS,
            "Invalid params",
            Some(Value::String(detail.into())),
        )
    }

    /// Internal error (-32603)
    pub fn internal_error(detail: impl Into<String>) -> Self {
        Self::new(
            error_codes::INTERNAL_ERROR,
            "Internal error",
            Some(Value::String(detail.into())),
        )
    }
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// JSON-RPC 2.0 Request Message
///
/// A request invokes a method on the remote peer and expects exactly one
/// response (success or error) correlated by `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    /// Protocol version - always "2.0"
    pub jsonrpc: String,

    /// Name of the method to invoke
    pub method: String,

    /// Parameters for the method (object or array)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    /// Unique identifier for this request
    pub id: RequestId,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC 2.0 request
    pub fn new(method: impl Into<String>, params: Option<Value>, id: RequestId) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }

    /// Read the progress token from `params._meta.progressToken`, if any
    pub fn progress_token(&self) -> Option<&Value> {
        self.params
            .as_ref()
            .and_then(|p| p.get("_meta"))
            .and_then(|m| m.get("progressToken"))
    }
}

impl WireFormat for JsonRpcRequest {}

/// JSON-RPC 2.0 Response Message
///
/// Carries either a successful `result` or an `error` object, never both.
/// The `id` matches the originating request; it is null only on error
/// responses to requests whose id could not be recovered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    /// Protocol version - always "2.0"
    pub jsonrpc: String,

    /// Result of a successful invocation (mutually exclusive with error)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error details for a failed invocation (mutually exclusive with result)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,

    /// Request identifier from the original request
    pub id: Option<RequestId>,
}

impl JsonRpcResponse {
    /// Create a successful response
    pub fn success(result: Value, id: RequestId) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id: Some(id),
        }
    }

    /// Create an error response
    pub fn error(error: JsonRpcError, id: Option<RequestId>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    /// True when this response carries an error object
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

impl WireFormat for JsonRpcResponse {}

/// JSON-RPC 2.0 Notification Message
///
/// A request without an `id`; the receiver never responds to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcNotification {
    /// Protocol version - always "2.0"
    pub jsonrpc: String,

    /// Name of the notification method
    pub method: String,

    /// Parameters for the notification (object or array)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a new JSON-RPC 2.0 notification
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

impl WireFormat for JsonRpcNotification {}

/// Unified JSON-RPC message type
///
/// All three message kinds in a single enum for transport and dispatch.
/// Serialization is transparent (no tag on the wire); deserialization
/// classifies by the keys actually present and validates the `jsonrpc`
/// marker, rejecting malformed shapes with [`MessageError`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// JSON-RPC request message
    Request(JsonRpcRequest),
    /// JSON-RPC notification message
    Notification(JsonRpcNotification),
    /// JSON-RPC response message (success or error)
    Response(JsonRpcResponse),
}

impl JsonRpcMessage {
    /// Create a request message
    pub fn request(method: &str, params: Option<Value>, id: RequestId) -> Self {
        JsonRpcMessage::Request(JsonRpcRequest::new(method, params, id))
    }

    /// Create a notification message
    pub fn notification(method: &str, params: Option<Value>) -> Self {
        JsonRpcMessage::Notification(JsonRpcNotification::new(method, params))
    }

    /// Create a success response message
    pub fn response(result: Value, id: RequestId) -> Self {
        JsonRpcMessage::Response(JsonRpcResponse::success(result, id))
    }

    /// Create an error response message
    pub fn error_response(error: JsonRpcError, id: Option<RequestId>) -> Self {
        JsonRpcMessage::Response(JsonRpcResponse::error(error, id))
    }

    /// True for request messages
    pub fn is_request(&self) -> bool {
        matches!(self, JsonRpcMessage::Request(_))
    }

    /// True for notification messages
    pub fn is_notification(&self) -> bool {
        matches!(self, JsonRpcMessage::Notification(_))
    }

    /// True for response messages (success or error)
    pub fn is_response(&self) -> bool {
        matches!(self, JsonRpcMessage::Response(_))
    }

    /// The request id a receiver must answer, if this is a request
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.id),
            _ => None,
        }
    }

    /// The id carried by a response, if this is a response
    pub fn response_id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Response(r) => r.id.as_ref(),
            _ => None,
        }
    }

    /// The method name, for requests and notifications
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.method),
            JsonRpcMessage::Notification(n) => Some(&n.method),
            JsonRpcMessage::Response(_) => None,
        }
    }
}

impl WireFormat for JsonRpcMessage {}

impl From<JsonRpcRequest> for JsonRpcMessage {
    fn from(request: JsonRpcRequest) -> Self {
        JsonRpcMessage::Request(request)
    }
}

impl From<JsonRpcNotification> for JsonRpcMessage {
    fn from(notification: JsonRpcNotification) -> Self {
        JsonRpcMessage::Notification(notification)
    }
}

impl From<JsonRpcResponse> for JsonRpcMessage {
    fn from(response: JsonRpcResponse) -> Self {
        JsonRpcMessage::Response(response)
    }
}

impl<'de> Deserialize<'de> for JsonRpcMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        JsonRpcMessage::try_from(value).map_err(serde::de::Error::custom)
    }
}

impl TryFrom<Value> for JsonRpcMessage {
    type Error = MessageError;

    fn try_from(value: Value) -> Result<Self, MessageError> {
        let object = match value {
            Value::Object(object) => object,
            other => {
                return Err(MessageError::InvalidRequest {
                    message: format!("message must be a JSON object, got {other}"),
                })
            }
        };
        classify_object(object)
    }
}

/// Classify a JSON object into one of the three message kinds
///
/// Classification is driven by which keys are present:
/// - `method` + `id` is a request
/// - `method` without `id` is a notification
/// - `result` or `error` is a response (exactly one of the two)
fn classify_object(object: Map<String, Value>) -> Result<JsonRpcMessage, MessageError> {
    match object.get("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => {}
        Some(other) => {
            return Err(MessageError::InvalidRequest {
                message: format!("jsonrpc field must be \"2.0\", got {other}"),
            })
        }
        None => {
            return Err(MessageError::InvalidRequest {
                message: "missing jsonrpc field".to_string(),
            })
        }
    }

    let has_method = object.contains_key("method");
    let has_result = object.contains_key("result");
    let has_error = object.contains_key("error");

    if has_method {
        let method = match object.get("method") {
            Some(Value::String(m)) => m.clone(),
            _ => {
                return Err(MessageError::InvalidRequest {
                    message: "method field must be a string".to_string(),
                })
            }
        };
        let params = object.get("params").cloned();

        return match object.get("id") {
            Some(id_value) => {
                let id = RequestId::from_value(id_value)?;
                Ok(JsonRpcMessage::Request(JsonRpcRequest {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    method,
                    params,
                    id,
                }))
            }
            None => Ok(JsonRpcMessage::Notification(JsonRpcNotification {
                jsonrpc: JSONRPC_VERSION.to_string(),
                method,
                params,
            })),
        };
    }

    if has_result || has_error {
        if has_result && has_error {
            return Err(MessageError::InvalidRequest {
                message: "response carries both result and error".to_string(),
            });
        }
        let id = match object.get("id") {
            None | Some(Value::Null) => None,
            Some(id_value) => Some(RequestId::from_value(id_value)?),
        };
        if id.is_none() && has_result {
            return Err(MessageError::InvalidRequest {
                message: "success response requires a non-null id".to_string(),
            });
        }
        let error = match object.get("error") {
            Some(e) => Some(serde_json::from_value::<JsonRpcError>(e.clone()).map_err(|e| {
                MessageError::InvalidRequest {
                    message: format!("malformed error object: {e}"),
                }
            })?),
            None => None,
        };
        return Ok(JsonRpcMessage::Response(JsonRpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: object.get("result").cloned(),
            error,
            id,
        }));
    }

    Err(MessageError::InvalidRequest {
        message: "message is neither a request, notification, nor response".to_string(),
    })
}

/// One wire frame: a single message or an ordered batch
///
/// HTTP bodies and SSE `data:` payloads are parsed through this type.
/// Batch validation is all-or-nothing: one malformed element rejects the
/// whole frame, and the empty batch is itself invalid.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcFrame {
    /// A single JSON-RPC message
    Single(JsonRpcMessage),
    /// An ordered batch of messages sent as one JSON array
    Batch(Vec<JsonRpcMessage>),
}

impl JsonRpcFrame {
    /// Parse a frame from raw bytes
    ///
    /// Malformed JSON maps to [`MessageError::Parse`] (-32700); a valid JSON
    /// document with an invalid message shape maps to
    /// [`MessageError::InvalidRequest`] (-32600).
    pub fn from_slice(bytes: &[u8]) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| MessageError::Parse {
            message: e.to_string(),
        })?;
        Self::from_value(value)
    }

    /// Parse a frame from an already-decoded JSON value
    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        match value {
            Value::Array(elements) => {
                if elements.is_empty() {
                    return Err(MessageError::InvalidRequest {
                        message: "batch must not be empty".to_string(),
                    });
                }
                let messages = elements
                    .into_iter()
                    .map(JsonRpcMessage::try_from)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(JsonRpcFrame::Batch(messages))
            }
            other => Ok(JsonRpcFrame::Single(JsonRpcMessage::try_from(other)?)),
        }
    }

    /// Iterate over the messages in this frame, in wire order
    pub fn messages(&self) -> impl Iterator<Item = &JsonRpcMessage> {
        match self {
            JsonRpcFrame::Single(message) => std::slice::from_ref(message).iter(),
            JsonRpcFrame::Batch(messages) => messages.iter(),
        }
    }

    /// Consume the frame into its messages, in wire order
    pub fn into_messages(self) -> Vec<JsonRpcMessage> {
        match self {
            JsonRpcFrame::Single(message) => vec![message],
            JsonRpcFrame::Batch(messages) => messages,
        }
    }

    /// True when the frame was a batch on the wire
    pub fn is_batch(&self) -> bool {
        matches!(self, JsonRpcFrame::Batch(_))
    }

    /// True when any contained message is a request
    pub fn contains_request(&self) -> bool {
        self.messages().any(JsonRpcMessage::is_request)
    }

    /// The ids of every contained request, in wire order
    pub fn request_ids(&self) -> Vec<RequestId> {
        self.messages()
            .filter_map(|m| m.request_id().cloned())
            .collect()
    }
}

impl<'de> Deserialize<'de> for JsonRpcFrame {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        JsonRpcFrame::from_value(value).map_err(serde::de::Error::custom)
    }
}

impl WireFormat for JsonRpcFrame {}

impl From<JsonRpcMessage> for JsonRpcFrame {
    fn from(message: JsonRpcMessage) -> Self {
        JsonRpcFrame::Single(message)
    }
}
