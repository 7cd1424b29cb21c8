//! Protocol Constants
//!
//! Method names, error codes, HTTP header names, and default values shared
//! across the crate so the wire strings live in one place.

/// MCP protocol method names
pub mod methods {
    /// Initialization request
    pub const INITIALIZE: &str = "initialize";
    /// Initialization-complete notification
    pub const INITIALIZED: &str = "notifications/initialized";

    /// Connectivity testing request
    pub const PING: &str = "ping";

    /// Progress notification referencing a progress token
    pub const PROGRESS: &str = "notifications/progress";
    /// Cancellation notification referencing an in-flight request id
    pub const CANCELLED: &str = "notifications/cancelled";
    /// Log message notification
    pub const MESSAGE: &str = "notifications/message";
}

/// JSON-RPC and MCP error codes
pub mod error_codes {
    /// Parse error - invalid JSON was received
    pub const PARSE_ERROR: i32 = -32700;

    /// Invalid Request - the JSON sent is not a valid request object
    pub const INVALID_REQUEST: i32 = -32600;

    /// Method not found - the method does not exist / is not available
    pub const METHOD_NOT_FOUND: i32 = -32601;

    /// Invalid params - invalid method parameter(s)
    pub const INVALID_PARAMS: i32 = -32602;

    /// Internal error - internal JSON-RPC error
    pub const INTERNAL_ERROR: i32 = -32603;

    /// Generic MCP protocol error (also "server not initialized")
    pub const SERVER_ERROR: i32 = -32000;

    /// Session not found - the mcp-session-id header names no live session
    pub const SESSION_NOT_FOUND: i32 = -32001;

    /// Connection closed while a request was in flight (client-side only,
    /// never written to the wire)
    pub const CONNECTION_CLOSED: i32 = -1;
}

/// HTTP header names used by the streamable HTTP transport
pub mod headers {
    /// Opaque session identifier assigned by the server on initialize
    pub const MCP_SESSION_ID: &str = "mcp-session-id";

    /// SSE resumption token presented by a reconnecting client
    pub const LAST_EVENT_ID: &str = "last-event-id";

    /// Negotiated protocol version, attached by clients once known
    pub const MCP_PROTOCOL_VERSION: &str = "mcp-protocol-version";
}

/// Protocol version negotiation data
pub mod protocol_versions {
    /// The most recent protocol revision this crate speaks
    pub const LATEST: &str = "2025-03-26";

    /// Every revision this crate accepts, newest first
    pub const SUPPORTED: &[&str] = &["2025-03-26", "2024-11-05", "2024-10-07"];

    /// True when `version` is one of [`SUPPORTED`]
    pub fn is_supported(version: &str) -> bool {
        SUPPORTED.contains(&version)
    }
}

/// Default values shared by transports and the engine
pub mod defaults {
    use std::time::Duration;

    /// Default timeout for outbound requests
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

    /// Largest HTTP body the server transport will read
    pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

    /// Per-stream SSE writer channel capacity
    pub const STREAM_CHANNEL_CAPACITY: usize = 64;

    /// Events retained per stream by the in-memory event store
    pub const EVENT_STORE_CAPACITY: usize = 1024;

    /// Initial delay before the first SSE reconnect attempt
    pub const RECONNECT_INITIAL_DELAY: Duration = Duration::from_millis(1000);

    /// Multiplier applied to the reconnect delay after each attempt
    pub const RECONNECT_GROWTH_FACTOR: f64 = 1.5;

    /// Upper bound on the reconnect delay
    pub const RECONNECT_MAX_DELAY: Duration = Duration::from_millis(30_000);

    /// Reconnect attempts before giving up on a broken SSE stream
    pub const RECONNECT_MAX_RETRIES: u32 = 2;
}
