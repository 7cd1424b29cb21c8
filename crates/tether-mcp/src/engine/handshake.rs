//! Initialization Handshake
//!
//! The lifecycle handshake on top of the engine: the client sends
//! `initialize` first and refuses protocol versions it does not speak;
//! the server echoes a requested version it recognizes and otherwise
//! answers with the latest it supports, advertising its capabilities in
//! the reply; `notifications/initialized` finalizes setup.

// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use serde_json::Value;
use tracing::debug;

// Layer 3: Internal module imports
use super::engine::{ProtocolEngine, RequestOptions};
use super::error::EngineError;
use crate::protocol::{
    methods, ClientCapabilities, Implementation, InitializeParams, InitializeResult, JsonRpcRequest,
    McpError, ProtocolVersion, ServerCapabilities, Transport,
};

/// Identity a server-role engine advertises during initialization
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    /// Server implementation info
    pub server_info: Implementation,
    /// Capabilities advertised in the initialize reply
    pub capabilities: ServerCapabilities,
    /// Optional usage guidance passed to the client's LLM host
    pub instructions: Option<String>,
}

impl ServerIdentity {
    /// Identity with empty capabilities
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            server_info: Implementation::new(name, version),
            capabilities: ServerCapabilities::default(),
            instructions: None,
        }
    }

    /// Set the advertised capabilities
    pub fn capabilities(mut self, capabilities: ServerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set the usage instructions
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }
}

/// Version selection rule: echo a recognized version, else offer the
/// latest this implementation speaks
pub fn negotiate_protocol_version(requested: &ProtocolVersion) -> ProtocolVersion {
    if requested.is_supported() {
        requested.clone()
    } else {
        ProtocolVersion::latest()
    }
}

/// Outcome of serving an `initialize` request
#[derive(Debug)]
pub(crate) struct InitializeReply {
    /// The serialized `InitializeResult`
    pub result: Value,
    /// The client's advertised capabilities, for the engine's records
    pub peer_capabilities: Option<Value>,
}

/// Serve an inbound `initialize` request against a server identity
pub(crate) fn handle_initialize_request(
    identity: &ServerIdentity,
    request: &JsonRpcRequest,
) -> Result<InitializeReply, McpError> {
    let params = request
        .params
        .clone()
        .ok_or_else(|| McpError::invalid_params("initialize requires parameters"))?;
    let params: InitializeParams = serde_json::from_value(params)
        .map_err(|e| McpError::invalid_params(format!("malformed initialize parameters: {e}")))?;

    let negotiated = negotiate_protocol_version(&params.protocol_version);
    debug!(
        requested = params.protocol_version.as_str(),
        negotiated = negotiated.as_str(),
        client = %params.client_info.name,
        "initialize handshake"
    );

    let result = InitializeResult {
        protocol_version: negotiated,
        capabilities: identity.capabilities.clone(),
        server_info: identity.server_info.clone(),
        instructions: identity.instructions.clone(),
    };
    let peer_capabilities = serde_json::to_value(&params.capabilities).ok();
    let result = serde_json::to_value(&result)
        .map_err(|e| McpError::internal_error(format!("failed to encode result: {e}")))?;

    Ok(InitializeReply {
        result,
        peer_capabilities,
    })
}

impl<T: Transport + 'static> ProtocolEngine<T> {
    /// Run the client side of the handshake
    ///
    /// Sends `initialize`, validates the server's chosen protocol
    /// version against the supported set, records the server's
    /// capabilities for gating, and finalizes with
    /// `notifications/initialized`.
    pub async fn initialize(
        &self,
        client_info: Implementation,
        capabilities: ClientCapabilities,
    ) -> Result<InitializeResult, EngineError> {
        let params = InitializeParams {
            protocol_version: ProtocolVersion::latest(),
            capabilities,
            client_info,
        };
        let reply = self
            .request(
                methods::INITIALIZE,
                Some(serde_json::to_value(&params)?),
                RequestOptions::default(),
            )
            .await?;

        let result: InitializeResult = serde_json::from_value(reply)
            .map_err(|e| EngineError::Protocol(McpError::invalid_params(format!(
                "malformed initialize result: {e}"
            ))))?;

        if !result.protocol_version.is_supported() {
            return Err(EngineError::UnsupportedProtocolVersion {
                version: result.protocol_version.as_str().to_string(),
            });
        }

        if let Ok(capabilities) = serde_json::to_value(&result.capabilities) {
            self.set_peer_capabilities(capabilities);
        }
        self.notify(methods::INITIALIZED, None).await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{protocol_versions, RequestId, ToolsCapability};
    use serde_json::json;

    #[test]
    fn recognized_versions_are_echoed() {
        for version in protocol_versions::SUPPORTED {
            let negotiated = negotiate_protocol_version(&ProtocolVersion::from(*version));
            assert_eq!(negotiated.as_str(), *version);
        }
    }

    #[test]
    fn unknown_versions_fall_back_to_latest() {
        let negotiated = negotiate_protocol_version(&ProtocolVersion::from("1999-01-01"));
        assert_eq!(negotiated.as_str(), protocol_versions::LATEST);
    }

    #[test]
    fn initialize_reply_carries_identity_and_negotiated_version() {
        let identity = ServerIdentity::new("test-server", "0.1.0")
            .capabilities(ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(true),
                }),
                ..Default::default()
            })
            .instructions("be gentle");

        let request = JsonRpcRequest::new(
            methods::INITIALIZE,
            Some(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"roots": {}},
                "clientInfo": {"name": "t", "version": "1"}
            })),
            RequestId::new_number(1),
        );

        let reply = handle_initialize_request(&identity, &request).unwrap();
        assert_eq!(reply.result["protocolVersion"], "2024-11-05");
        assert_eq!(reply.result["serverInfo"]["name"], "test-server");
        assert_eq!(reply.result["instructions"], "be gentle");
        assert_eq!(reply.peer_capabilities, Some(json!({"roots": {}})));
    }

    #[test]
    fn initialize_without_params_is_invalid() {
        let identity = ServerIdentity::new("s", "1");
        let request = JsonRpcRequest::new(methods::INITIALIZE, None, RequestId::new_number(1));
        let error = handle_initialize_request(&identity, &request).unwrap_err();
        assert_eq!(error.code, -32602);
    }
}
