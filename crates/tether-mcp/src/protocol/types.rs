//! MCP Lifecycle Types
//!
//! Typed payloads for the initialization handshake plus the progress and
//! cancellation notification parameters the engine understands. Everything
//! here serializes with the camelCase field names the wire uses; unknown
//! peer extensions ride along in the `experimental` slots.

// Layer 1: Standard library imports
use std::fmt;

// Layer 2: Third-party crate imports
use serde::{Deserialize, Serialize};
use serde_json::Value;

// Layer 3: Internal module imports
use super::constants::protocol_versions;
use super::message::RequestId;

/// A dated MCP protocol revision such as `2025-03-26`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion(pub String);

impl ProtocolVersion {
    /// The latest revision this crate speaks
    pub fn latest() -> Self {
        ProtocolVersion(protocol_versions::LATEST.to_string())
    }

    /// True when this revision is in the supported set
    pub fn is_supported(&self) -> bool {
        protocol_versions::is_supported(&self.0)
    }

    /// The revision string as sent on the wire
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProtocolVersion {
    fn from(version: &str) -> Self {
        ProtocolVersion(version.to_string())
    }
}

/// Name and version a peer advertises about itself during initialization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    /// Implementation name (e.g. a product or binary name)
    pub name: String,
    /// Implementation version string
    pub version: String,
}

impl Implementation {
    /// Create implementation info
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Capabilities a client advertises during initialization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    /// Non-standard capability extensions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,

    /// Filesystem-roots capability
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<RootsCapability>,

    /// LLM sampling capability
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,
}

/// Roots capability details
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootsCapability {
    /// Whether the client emits `notifications/roots/list_changed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Capabilities a server advertises in its initialize reply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    /// Non-standard capability extensions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,

    /// Structured logging capability
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,

    /// Prompt templates capability
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<PromptsCapability>,

    /// Resources capability
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,

    /// Tools capability
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
}

/// Prompts capability details
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptsCapability {
    /// Whether the server emits `notifications/prompts/list_changed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Resources capability details
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesCapability {
    /// Whether resource subscriptions are supported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<bool>,
    /// Whether the server emits `notifications/resources/list_changed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Tools capability details
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    /// Whether the server emits `notifications/tools/list_changed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Parameters of the `initialize` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Protocol revision the client wants to speak
    pub protocol_version: ProtocolVersion,
    /// Client capability advertisement
    pub capabilities: ClientCapabilities,
    /// Client implementation info
    pub client_info: Implementation,
}

/// Result of the `initialize` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Protocol revision the server selected
    pub protocol_version: ProtocolVersion,
    /// Server capability advertisement
    pub capabilities: ServerCapabilities,
    /// Server implementation info
    pub server_info: Implementation,
    /// Optional free-form usage guidance for the client's LLM host
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Parameters of a `notifications/progress` notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressParams {
    /// Token chosen by the requester and echoed back here
    pub progress_token: Value,
    /// Work completed so far
    pub progress: f64,
    /// Total expected work, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    /// Optional human-readable status line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Parameters of a `notifications/cancelled` notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    /// The in-flight request being cancelled
    pub request_id: RequestId,
    /// Optional reason, surfaced to the handler / waiter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn initialize_params_use_camel_case_on_the_wire() {
        let params = InitializeParams {
            protocol_version: ProtocolVersion::latest(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation::new("t", "1"),
        };
        let value = serde_json::to_value(&params).unwrap();
        assert!(value.get("protocolVersion").is_some());
        assert!(value.get("clientInfo").is_some());
    }

    #[test]
    fn server_capabilities_skip_absent_sections() {
        let caps = ServerCapabilities {
            tools: Some(ToolsCapability {
                list_changed: Some(true),
            }),
            ..Default::default()
        };
        let value = serde_json::to_value(&caps).unwrap();
        assert_eq!(value, json!({"tools": {"listChanged": true}}));
    }

    #[test]
    fn progress_params_round_trip() {
        let params = ProgressParams {
            progress_token: json!(7),
            progress: 2.0,
            total: Some(3.0),
            message: None,
        };
        let value = serde_json::to_value(&params).unwrap();
        let back: ProgressParams = serde_json::from_value(value).unwrap();
        assert_eq!(params, back);
    }

    #[test]
    fn protocol_version_support_check() {
        assert!(ProtocolVersion::latest().is_supported());
        assert!(!ProtocolVersion::from("1999-01-01").is_supported());
    }
}
