//! Streamable HTTP Configuration
//!
//! Config structs for both sides of the transport, with builder-style
//! setters and defaults that match the protocol's documented behavior.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party crate imports
use uuid::Uuid;

// Layer 3: Internal module imports
use super::auth::AuthProvider;
use crate::protocol::defaults;
use crate::transport::event_store::EventStore;

/// Generator for new session identifiers
pub type SessionIdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Configuration for [`super::StreamableHttpServerTransport`]
///
/// The default configuration is stateful (UUID v4 session ids), streams
/// responses over SSE, and keeps no event history.
#[derive(Clone)]
pub struct StreamableHttpServerConfig {
    /// Produces the session id assigned on `initialize`; `None` runs the
    /// server stateless (no session header, no session validation)
    pub session_id_generator: Option<SessionIdGenerator>,

    /// Answer request-carrying POSTs with a buffered JSON body instead of
    /// an SSE stream
    pub enable_json_response: bool,

    /// Event persistence enabling `Last-Event-ID` replay
    pub event_store: Option<Arc<dyn EventStore>>,

    /// Largest request body accepted before the framing error kicks in
    pub max_body_bytes: usize,

    /// Capacity of each SSE stream's writer channel
    pub stream_channel_capacity: usize,
}

impl StreamableHttpServerConfig {
    /// Stateful configuration with UUID v4 session ids
    pub fn new() -> Self {
        Self {
            session_id_generator: Some(Arc::new(|| Uuid::new_v4().to_string())),
            enable_json_response: false,
            event_store: None,
            max_body_bytes: defaults::MAX_BODY_BYTES,
            stream_channel_capacity: defaults::STREAM_CHANNEL_CAPACITY,
        }
    }

    /// Stateless configuration: no session ids, no session validation
    pub fn stateless() -> Self {
        Self {
            session_id_generator: None,
            ..Self::new()
        }
    }

    /// Use a custom session id generator
    pub fn session_id_generator(
        mut self,
        generator: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        self.session_id_generator = Some(Arc::new(generator));
        self
    }

    /// Switch request-carrying POSTs to buffered JSON responses
    pub fn enable_json_response(mut self, enabled: bool) -> Self {
        self.enable_json_response = enabled;
        self
    }

    /// Attach an event store, enabling stream resumability
    pub fn event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.event_store = Some(store);
        self
    }

    /// Override the request body size cap
    pub fn max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }
}

impl Default for StreamableHttpServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StreamableHttpServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamableHttpServerConfig")
            .field("stateless", &self.session_id_generator.is_none())
            .field("enable_json_response", &self.enable_json_response)
            .field("has_event_store", &self.event_store.is_some())
            .field("max_body_bytes", &self.max_body_bytes)
            .finish()
    }
}

/// Backoff schedule for SSE reconnection
#[derive(Debug, Clone)]
pub struct ReconnectionOptions {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Multiplier applied per attempt
    pub growth_factor: f64,
    /// Ceiling on the computed delay
    pub max_delay: Duration,
    /// Retries before the stream is abandoned with an error
    pub max_retries: u32,
}

impl ReconnectionOptions {
    /// The delay to wait before retry number `attempt` (zero-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.growth_factor.powi(attempt as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        Duration::from_millis(millis as u64).min(self.max_delay)
    }
}

impl Default for ReconnectionOptions {
    fn default() -> Self {
        Self {
            initial_delay: defaults::RECONNECT_INITIAL_DELAY,
            growth_factor: defaults::RECONNECT_GROWTH_FACTOR,
            max_delay: defaults::RECONNECT_MAX_DELAY,
            max_retries: defaults::RECONNECT_MAX_RETRIES,
        }
    }
}

/// Configuration for [`super::StreamableHttpClientTransport`]
#[derive(Clone)]
pub struct StreamableHttpClientConfig {
    /// The MCP endpoint URL
    pub url: String,

    /// Extra headers attached to every request; reserved names
    /// (`Content-Type`, `Accept`, `mcp-session-id`, `Authorization`) are
    /// controlled by the transport and cannot be overridden
    pub headers: HashMap<String, String>,

    /// Auth provider driving the 401 recovery flow
    pub auth_provider: Option<Arc<dyn AuthProvider>>,

    /// SSE reconnection backoff schedule
    pub reconnection: ReconnectionOptions,

    /// Resume an existing session instead of starting fresh
    pub session_id: Option<String>,

    /// TCP connect timeout for the underlying HTTP client
    pub connect_timeout: Duration,
}

impl StreamableHttpClientConfig {
    /// Configuration for the given endpoint with defaults everywhere else
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            auth_provider: None,
            reconnection: ReconnectionOptions::default(),
            session_id: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Attach one extra request header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Attach an auth provider
    pub fn auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth_provider = Some(provider);
        self
    }

    /// Override the reconnection schedule
    pub fn reconnection(mut self, options: ReconnectionOptions) -> Self {
        self.reconnection = options;
        self
    }

    /// Preset the session id (resuming a known session)
    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

impl fmt::Debug for StreamableHttpClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamableHttpClientConfig")
            .field("url", &self.url)
            .field("has_auth_provider", &self.auth_provider.is_some())
            .field("session_id", &self.session_id)
            .finish()
    }
}
