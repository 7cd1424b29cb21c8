//! Streamable HTTP Client Transport
//!
//! The client half of the streamable HTTP transport. Outbound frames go
//! out as POSTs negotiated for either a JSON body or an SSE stream; the
//! standalone server-to-client stream is opened lazily with GET once the
//! client has sent `notifications/initialized`. SSE streams record their
//! event ids as resumption tokens, reconnect with exponential backoff
//! after errors, and can be resumed explicitly through
//! [`crate::protocol::SendOptions::resume_from`].

// Layer 1: Standard library imports
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// Layer 3: Internal module imports
use super::auth::AuthOutcome;
use super::config::StreamableHttpClientConfig;
use crate::protocol::{
    headers as mcp_headers, methods, JsonRpcFrame, JsonRpcMessage, MessageContext, MessageHandler,
    RequestId, SendOptions, Transport, TransportError, WireFormat,
};
use crate::transport::sse::{SseEvent, SseParser};

/// Shared state behind the transport handle and its background tasks
struct ClientState {
    config: StreamableHttpClientConfig,
    http: reqwest::Client,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    session_id: RwLock<Option<String>>,
    protocol_version: RwLock<Option<String>>,
    cancel: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
    close_notified: AtomicBool,
    standalone_opened: AtomicBool,
}

impl ClientState {
    fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn session_id(&self) -> Option<String> {
        self.session_id
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn protocol_version(&self) -> Option<String> {
        self.protocol_version
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn is_shutting_down(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }

    async fn report_error(&self, error: TransportError) {
        if let Some(handler) = self.handler() {
            handler.handle_error(error).await;
        }
    }

    async fn notify_close(&self) {
        if self.close_notified.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handler) = self.handler() {
            handler.handle_close().await;
        }
    }

    /// Remember the session id a response advertised
    fn capture_session_id(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(value) = headers
            .get(mcp_headers::MCP_SESSION_ID)
            .and_then(|value| value.to_str().ok())
        {
            debug!(session_id = value, "session id captured");
            *self
                .session_id
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(value.to_string());
        }
    }
}

/// Per-stream consumer context
struct StreamScope {
    /// Last SSE event id observed; doubles as the resumption token
    last_event_id: Option<String>,
    /// Rewrite response ids to this value (set when resuming a request)
    replay_message_id: Option<RequestId>,
    /// Reconnect attempts consumed since the last healthy connection
    attempt: u32,
}

/// Attach caller headers and the reserved transport headers
///
/// Caller-supplied names go first so the reserved names (`Accept`,
/// `Content-Type`, session, authorization) always win on conflict.
async fn with_common_headers(
    state: &ClientState,
    mut builder: reqwest::RequestBuilder,
) -> reqwest::RequestBuilder {
    for (name, value) in &state.config.headers {
        builder = builder.header(name, value);
    }
    if let Some(session_id) = state.session_id() {
        builder = builder.header(mcp_headers::MCP_SESSION_ID, session_id);
    }
    if let Some(version) = state.protocol_version() {
        builder = builder.header(mcp_headers::MCP_PROTOCOL_VERSION, version);
    }
    if let Some(provider) = &state.config.auth_provider {
        if let Some(token) = provider.access_token().await {
            builder = builder.header(reqwest::header::AUTHORIZATION, format!("Bearer {token}"));
        }
    }
    builder
}

/// Drive the provider's auth flow after a 401
///
/// Anything but an inline `Authorized` outcome surfaces as
/// [`TransportError::Unauthorized`]; a redirect is finished later through
/// [`StreamableHttpClientTransport::finish_auth`].
async fn run_auth_flow(state: &ClientState) -> Result<(), TransportError> {
    let provider = state
        .config
        .auth_provider
        .as_ref()
        .ok_or(TransportError::Unauthorized)?;
    match provider.authorize().await {
        Ok(AuthOutcome::Authorized) => Ok(()),
        Ok(AuthOutcome::Redirect(url)) => {
            debug!(url, "authorization requires a user redirect");
            Err(TransportError::Unauthorized)
        }
        Err(e) => {
            warn!("authorization flow failed: {e}");
            Err(TransportError::Unauthorized)
        }
    }
}

fn is_initialized_notification(frame: &JsonRpcFrame) -> bool {
    matches!(
        frame,
        JsonRpcFrame::Single(JsonRpcMessage::Notification(n))
            if n.method == methods::INITIALIZED
    )
}

/// POST one frame and route whatever comes back
async fn post_frame(state: &Arc<ClientState>, frame: &JsonRpcFrame) -> Result<(), TransportError> {
    let body = frame.to_json()?;
    let mut attempted_auth = false;

    loop {
        let builder = state
            .http
            .post(&state.config.url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(body.clone());
        let builder = with_common_headers(state, builder).await;

        let response = tokio::select! {
            _ = state.cancel.cancelled() => {
                return Err(TransportError::connection("transport closed"));
            }
            result = builder.send() => result.map_err(|e| {
                TransportError::connection(format!("HTTP request failed: {e}"))
            })?,
        };

        state.capture_session_id(response.headers());
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            if attempted_auth {
                return Err(TransportError::Unauthorized);
            }
            attempted_auth = true;
            run_auth_flow(state).await?;
            continue;
        }

        if status == StatusCode::ACCEPTED {
            if is_initialized_notification(frame) {
                open_standalone_stream(Arc::clone(state));
            }
            return Ok(());
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                message,
            });
        }

        if !frame.contains_request() {
            // Some servers answer 200 instead of 202; nothing to consume.
            return Ok(());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            spawn_sse_consumer(
                Arc::clone(state),
                response,
                StreamScope {
                    last_event_id: None,
                    replay_message_id: None,
                    attempt: 0,
                },
            );
            return Ok(());
        }
        if content_type.contains("application/json") {
            let bytes = response.bytes().await.map_err(|e| {
                TransportError::connection(format!("failed to read response body: {e}"))
            })?;
            let inbound = JsonRpcFrame::from_slice(&bytes)
                .map_err(|e| TransportError::protocol(e.to_string()))?;
            for message in inbound.into_messages() {
                deliver(state, message, None).await;
            }
            return Ok(());
        }
        return Err(TransportError::protocol(format!(
            "unexpected content type: {content_type}"
        )));
    }
}

/// GET an event stream, optionally resuming from a recorded event id
async fn get_event_stream(
    state: &Arc<ClientState>,
    last_event_id: Option<&str>,
) -> Result<reqwest::Response, TransportError> {
    let mut attempted_auth = false;

    loop {
        let mut builder = state
            .http
            .get(&state.config.url)
            .header(ACCEPT, "text/event-stream");
        if let Some(last_event_id) = last_event_id {
            builder = builder.header(mcp_headers::LAST_EVENT_ID, last_event_id);
        }
        let builder = with_common_headers(state, builder).await;

        let response = tokio::select! {
            _ = state.cancel.cancelled() => {
                return Err(TransportError::connection("transport closed"));
            }
            result = builder.send() => result.map_err(|e| {
                TransportError::connection(format!("HTTP request failed: {e}"))
            })?,
        };

        state.capture_session_id(response.headers());
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            if attempted_auth {
                return Err(TransportError::Unauthorized);
            }
            attempted_auth = true;
            run_auth_flow(state).await?;
            continue;
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                message,
            });
        }
        return Ok(response);
    }
}

/// Open the standalone server-to-client stream (fire and forget)
fn open_standalone_stream(state: Arc<ClientState>) {
    if state.standalone_opened.swap(true, Ordering::AcqRel) {
        return;
    }
    tokio::spawn(async move {
        match get_event_stream(&state, None).await {
            Ok(response) => {
                debug!("standalone stream opened");
                spawn_sse_consumer(
                    Arc::clone(&state),
                    response,
                    StreamScope {
                        last_event_id: None,
                        replay_message_id: None,
                        attempt: 0,
                    },
                );
            }
            Err(TransportError::Http { status: 405, .. }) => {
                // The server opted out of server-initiated streams.
                debug!("server does not offer a standalone stream");
            }
            Err(e) => {
                state.standalone_opened.store(false, Ordering::Release);
                state.report_error(e).await;
            }
        }
    });
}

fn spawn_sse_consumer(state: Arc<ClientState>, response: reqwest::Response, scope: StreamScope) {
    tokio::spawn(run_sse_stream(state, response, scope));
}

/// Consume one SSE stream; on errors, reconnect with backoff
async fn run_sse_stream(
    state: Arc<ClientState>,
    mut response: reqwest::Response,
    mut scope: StreamScope,
) {
    'stream: loop {
        let mut parser = SseParser::new();
        let mut body = response.bytes_stream();

        let failed = loop {
            tokio::select! {
                _ = state.cancel.cancelled() => return,
                chunk = body.next() => match chunk {
                    None => break false,
                    Some(Ok(bytes)) => {
                        for event in parser.feed(&bytes) {
                            handle_sse_event(&state, event, &mut scope).await;
                        }
                    }
                    Some(Err(e)) => {
                        debug!("SSE stream error: {e}");
                        break true;
                    }
                }
            }
        };

        if !failed || state.is_shutting_down() {
            // Request streams end when the server is done with them.
            return;
        }

        let Some(token) = scope.last_event_id.clone() else {
            state
                .report_error(TransportError::connection(
                    "SSE stream failed before any resumption token was observed",
                ))
                .await;
            return;
        };

        loop {
            if scope.attempt >= state.config.reconnection.max_retries {
                state
                    .report_error(TransportError::connection(
                        "maximum SSE reconnection attempts exceeded",
                    ))
                    .await;
                return;
            }
            let delay = state.config.reconnection.delay_for(scope.attempt);
            scope.attempt += 1;
            debug!(attempt = scope.attempt, ?delay, "scheduling SSE reconnect");
            tokio::select! {
                _ = state.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match get_event_stream(&state, Some(&token)).await {
                Ok(reconnected) => {
                    scope.attempt = 0;
                    response = reconnected;
                    continue 'stream;
                }
                Err(e) => {
                    debug!("SSE reconnect attempt failed: {e}");
                }
            }
        }
    }
}

async fn handle_sse_event(state: &Arc<ClientState>, event: SseEvent, scope: &mut StreamScope) {
    if event.event != "message" {
        return;
    }
    if let Some(id) = &event.id {
        scope.last_event_id = Some(id.clone());
    }
    match JsonRpcMessage::from_json(&event.data) {
        Ok(mut message) => {
            // A resumed stream replays the original request's responses
            // under whatever id the server recorded; re-key them so the
            // waiting caller still correlates.
            if let (Some(replay_id), JsonRpcMessage::Response(response)) =
                (&scope.replay_message_id, &mut message)
            {
                response.id = Some(replay_id.clone());
            }
            deliver(state, message, event.id.as_deref()).await;
        }
        Err(e) => {
            state
                .report_error(TransportError::Serialization { source: e })
                .await;
        }
    }
}

/// Hand one inbound message to the application handler
async fn deliver(state: &Arc<ClientState>, message: JsonRpcMessage, resumption_token: Option<&str>) {
    let Some(handler) = state.handler() else {
        return;
    };
    let mut context = match state.session_id() {
        Some(session_id) => MessageContext::new(session_id),
        None => MessageContext::without_session(),
    };
    if let Some(token) = resumption_token {
        context = context.with_metadata(MessageContext::<()>::LAST_EVENT_ID, token);
    }
    handler.handle_message(message, context).await;
}

/// Streamable HTTP client transport
///
/// # Examples
///
/// ```rust,no_run
/// use tether_mcp::transport::streamable::{
///     StreamableHttpClientConfig, StreamableHttpClientTransport,
/// };
///
/// let config = StreamableHttpClientConfig::new("http://localhost:3000/mcp");
/// let transport = StreamableHttpClientTransport::new(config).unwrap();
/// ```
pub struct StreamableHttpClientTransport {
    state: Arc<ClientState>,
}

impl StreamableHttpClientTransport {
    /// Create a transport for the configured endpoint
    pub fn new(config: StreamableHttpClientConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| TransportError::connection(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            state: Arc::new(ClientState {
                session_id: RwLock::new(config.session_id.clone()),
                config,
                http,
                handler: RwLock::new(None),
                protocol_version: RwLock::new(None),
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                close_notified: AtomicBool::new(false),
                standalone_opened: AtomicBool::new(false),
            }),
        })
    }

    fn ensure_active(&self) -> Result<(), TransportError> {
        if !self.state.started.load(Ordering::Acquire) {
            return Err(TransportError::connection("transport not started"));
        }
        if self.state.closed.load(Ordering::Acquire) {
            return Err(TransportError::connection("transport closed"));
        }
        Ok(())
    }

    /// Send an ordered batch in one POST frame
    pub async fn send_batch(&self, messages: Vec<JsonRpcMessage>) -> Result<(), TransportError> {
        self.ensure_active()?;
        post_frame(&self.state, &JsonRpcFrame::Batch(messages)).await
    }

    /// Record the negotiated protocol version; later requests carry it in
    /// the `mcp-protocol-version` header
    pub fn set_protocol_version(&self, version: impl Into<String>) {
        *self
            .state
            .protocol_version
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(version.into());
    }

    /// Complete an interrupted OAuth redirect flow
    pub async fn finish_auth(&self, code: &str) -> Result<(), TransportError> {
        let provider = self
            .state
            .config
            .auth_provider
            .as_ref()
            .ok_or(TransportError::Unauthorized)?;
        match provider.finish_authorization(code).await {
            Ok(AuthOutcome::Authorized) => Ok(()),
            _ => Err(TransportError::Unauthorized),
        }
    }

    /// Explicitly open the standalone server-to-client stream
    pub fn open_standalone_stream(&self) -> Result<(), TransportError> {
        self.ensure_active()?;
        open_standalone_stream(Arc::clone(&self.state));
        Ok(())
    }
}

#[async_trait]
impl Transport for StreamableHttpClientTransport {
    type Error = TransportError;

    fn set_message_handler(&mut self, handler: Arc<dyn MessageHandler>) {
        *self
            .state
            .handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handler);
    }

    async fn start(&mut self) -> Result<(), Self::Error> {
        if self.state.closed.load(Ordering::Acquire) {
            return Err(TransportError::connection("transport closed"));
        }
        if self.state.started.swap(true, Ordering::AcqRel) {
            return Err(TransportError::connection("transport already started"));
        }
        // No connection yet: the first POST creates one, and the
        // standalone GET follows the initialized notification.
        Ok(())
    }

    async fn send_with_options(
        &mut self,
        message: JsonRpcMessage,
        options: SendOptions,
    ) -> Result<(), Self::Error> {
        self.ensure_active()?;

        if let Some(token) = options.resumption_token {
            // Resume the broken stream instead of re-POSTing; responses on
            // it are re-keyed to the original request id.
            let replay_message_id = message.request_id().cloned();
            let response = get_event_stream(&self.state, Some(&token)).await?;
            spawn_sse_consumer(
                Arc::clone(&self.state),
                response,
                StreamScope {
                    last_event_id: Some(token),
                    replay_message_id,
                    attempt: 0,
                },
            );
            return Ok(());
        }

        post_frame(&self.state, &JsonRpcFrame::Single(message)).await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.state.cancel.cancel();
        self.state.notify_close().await;
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.state.session_id()
    }

    fn is_connected(&self) -> bool {
        self.state.started.load(Ordering::Acquire) && !self.state.closed.load(Ordering::Acquire)
    }

    fn transport_type(&self) -> &'static str {
        "streamable-http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcRequest;
    use crate::transport::streamable::auth::{AuthError, AuthProvider};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct RecordingHandler {
        messages: Mutex<Vec<(JsonRpcMessage, Option<String>)>>,
        errors: Mutex<Vec<String>>,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: Mutex::new(Vec::new()),
                errors: Mutex::new(Vec::new()),
            })
        }

        fn messages(&self) -> Vec<(JsonRpcMessage, Option<String>)> {
            self.messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle_message(&self, message: JsonRpcMessage, context: MessageContext) {
            self.messages
                .lock()
                .unwrap()
                .push((message, context.resumption_token().map(str::to_string)));
        }

        async fn handle_error(&self, error: TransportError) {
            self.errors.lock().unwrap().push(error.to_string());
        }

        async fn handle_close(&self) {}
    }

    async fn started_client(
        url: String,
        handler: Arc<RecordingHandler>,
    ) -> StreamableHttpClientTransport {
        let mut transport =
            StreamableHttpClientTransport::new(StreamableHttpClientConfig::new(url)).unwrap();
        transport.set_message_handler(handler);
        transport.start().await.unwrap();
        transport
    }

    fn initialize_request() -> JsonRpcMessage {
        JsonRpcMessage::request(
            "initialize",
            Some(json!({
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": {"name": "t", "version": "1"}
            })),
            RequestId::new_number(1),
        )
    }

    async fn wait_for_messages(handler: &RecordingHandler, count: usize) {
        for _ in 0..100 {
            if handler.messages().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {count} messages, got {}",
            handler.messages().len()
        );
    }

    #[tokio::test]
    async fn json_response_is_delivered_and_session_captured() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("mcp-session-id", "sess-1")
                    .set_body_raw(
                        r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#,
                        "application/json",
                    ),
            )
            .mount(&server)
            .await;

        let handler = RecordingHandler::new();
        let mut transport = started_client(format!("{}/mcp", server.uri()), handler.clone()).await;

        transport.send(initialize_request()).await.unwrap();

        assert_eq!(transport.session_id().as_deref(), Some("sess-1"));
        let messages = handler.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].0.is_response());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn session_header_is_attached_once_known() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header("mcp-session-id", "sess-9"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let handler = RecordingHandler::new();
        let config =
            StreamableHttpClientConfig::new(format!("{}/mcp", server.uri())).session_id("sess-9");
        let mut transport = StreamableHttpClientTransport::new(config).unwrap();
        transport.set_message_handler(handler);
        transport.start().await.unwrap();

        transport
            .send(JsonRpcMessage::notification("notifications/message", None))
            .await
            .unwrap();
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn non_success_status_becomes_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let handler = RecordingHandler::new();
        let mut transport = started_client(format!("{}/mcp", server.uri()), handler).await;

        let result = transport.send(initialize_request()).await;
        match result {
            Err(TransportError::Http { status, message }) => {
                assert_eq!(status, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("expected HTTP error, got {other:?}"),
        }
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn unauthorized_without_provider() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let handler = RecordingHandler::new();
        let mut transport = started_client(format!("{}/mcp", server.uri()), handler).await;
        let result = transport.send(initialize_request()).await;
        assert!(matches!(result, Err(TransportError::Unauthorized)));
        transport.close().await.unwrap();
    }

    struct TestAuthProvider {
        token: Mutex<Option<String>>,
        authorize_calls: AtomicUsize,
    }

    #[async_trait]
    impl AuthProvider for TestAuthProvider {
        async fn access_token(&self) -> Option<String> {
            self.token.lock().unwrap().clone()
        }

        async fn authorize(&self) -> Result<AuthOutcome, AuthError> {
            self.authorize_calls.fetch_add(1, Ordering::AcqRel);
            *self.token.lock().unwrap() = Some("fresh-token".to_string());
            Ok(AuthOutcome::Authorized)
        }

        async fn finish_authorization(&self, _code: &str) -> Result<AuthOutcome, AuthError> {
            Ok(AuthOutcome::Authorized)
        }
    }

    #[tokio::test]
    async fn http_401_runs_auth_flow_and_retries_once() {
        let server = MockServer::start().await;
        // Without the fresh token: 401. With it: success.
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer fresh-token"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let provider = Arc::new(TestAuthProvider {
            token: Mutex::new(None),
            authorize_calls: AtomicUsize::new(0),
        });
        let config = StreamableHttpClientConfig::new(format!("{}/mcp", server.uri()))
            .auth_provider(provider.clone());
        let mut transport = StreamableHttpClientTransport::new(config).unwrap();
        transport.set_message_handler(RecordingHandler::new());
        transport.start().await.unwrap();

        transport
            .send(JsonRpcMessage::notification("notifications/message", None))
            .await
            .unwrap();
        assert_eq!(provider.authorize_calls.load(Ordering::Acquire), 1);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn sse_response_delivers_messages_with_resumption_tokens() {
        let server = MockServer::start().await;
        let sse_body = "event: message\nid: s_1\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\",\"params\":{\"n\":1}}\n\n\
                        event: message\nid: s_2\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"done\":true}}\n\n";
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let handler = RecordingHandler::new();
        let mut transport = started_client(format!("{}/mcp", server.uri()), handler.clone()).await;
        transport.send(initialize_request()).await.unwrap();

        wait_for_messages(&handler, 2).await;
        let messages = handler.messages();
        assert!(messages[0].0.is_notification());
        assert_eq!(messages[0].1.as_deref(), Some("s_1"));
        assert!(messages[1].0.is_response());
        assert_eq!(messages[1].1.as_deref(), Some("s_2"));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn initialized_notification_triggers_standalone_get() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;
        // 405 is the server opting out; the client treats it as benign.
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(405))
            .expect(1)
            .mount(&server)
            .await;

        let handler = RecordingHandler::new();
        let mut transport = started_client(format!("{}/mcp", server.uri()), handler).await;
        transport
            .send(JsonRpcMessage::notification(methods::INITIALIZED, None))
            .await
            .unwrap();

        // The GET is fire-and-forget; give it a moment.
        tokio::time::sleep(Duration::from_millis(100)).await;
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn resumption_token_reopens_stream_and_rewrites_response_ids() {
        let server = MockServer::start().await;
        let replayed = "event: message\nid: s_6\ndata: {\"jsonrpc\":\"2.0\",\"id\":999,\"result\":{\"late\":true}}\n\n";
        Mock::given(method("GET"))
            .and(header("last-event-id", "s_5"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(replayed, "text/event-stream"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let handler = RecordingHandler::new();
        let mut transport = started_client(format!("{}/mcp", server.uri()), handler.clone()).await;

        // Resume request 42: no POST goes out, and the replayed response
        // is re-keyed from the server's recorded id to ours.
        let request = JsonRpcMessage::Request(JsonRpcRequest::new(
            "tools/call",
            None,
            RequestId::new_number(42),
        ));
        transport
            .send_with_options(request, SendOptions::resume_from("s_5"))
            .await
            .unwrap();

        wait_for_messages(&handler, 1).await;
        let messages = handler.messages();
        match &messages[0].0 {
            JsonRpcMessage::Response(response) => {
                assert_eq!(response.id, Some(RequestId::new_number(42)));
            }
            other => panic!("expected response, got {other:?}"),
        }
        assert_eq!(messages[0].1.as_deref(), Some("s_6"));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn send_before_start_and_after_close_fail() {
        let server = MockServer::start().await;
        let handler = RecordingHandler::new();
        let mut transport = StreamableHttpClientTransport::new(StreamableHttpClientConfig::new(
            format!("{}/mcp", server.uri()),
        ))
        .unwrap();
        transport.set_message_handler(handler);

        let result = transport
            .send(JsonRpcMessage::notification("x", None))
            .await;
        assert!(matches!(result, Err(TransportError::Connection { .. })));

        transport.start().await.unwrap();
        transport.close().await.unwrap();
        let result = transport
            .send(JsonRpcMessage::notification("x", None))
            .await;
        assert!(matches!(result, Err(TransportError::Connection { .. })));
    }

    #[tokio::test]
    async fn unexpected_content_type_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/plain")
                    .set_body_string("hello"),
            )
            .mount(&server)
            .await;

        let handler = RecordingHandler::new();
        let mut transport = started_client(format!("{}/mcp", server.uri()), handler).await;
        let result = transport.send(initialize_request()).await;
        assert!(matches!(result, Err(TransportError::Protocol { .. })));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn caller_headers_ride_along() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-custom", "yes"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let config = StreamableHttpClientConfig::new(format!("{}/mcp", server.uri()))
            .header("x-custom", "yes");
        let mut transport = StreamableHttpClientTransport::new(config).unwrap();
        transport.set_message_handler(RecordingHandler::new());
        transport.start().await.unwrap();
        transport
            .send(JsonRpcMessage::notification("n", None))
            .await
            .unwrap();
        transport.close().await.unwrap();
    }
}
