//! Streamable HTTP Server Transport
//!
//! One instance of [`StreamableHttpServerTransport`] is one session (or a
//! stateless endpoint). HTTP requests enter through
//! [`StreamableHttpHandler::handle`], which routes POST/GET/DELETE:
//!
//! - POST carries client frames; notification/response-only bodies get a
//!   bare 202, request-carrying bodies open an SSE stream (or, in JSON
//!   mode, defer a buffered JSON body) that the application's responses
//!   later complete
//! - GET opens the single standalone server-to-client stream, or replays
//!   a broken stream when the request carries `Last-Event-ID` and an
//!   event store is configured
//! - DELETE terminates the session
//!
//! Outbound messages route by response id, by the `related_request_id`
//! send option, or to the standalone stream.

// Layer 1: Standard library imports
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use axum::body::to_bytes;
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, trace, warn};
use uuid::Uuid;

// Layer 3: Internal module imports
use super::config::StreamableHttpServerConfig;
use super::session::{SseFrame, StreamRegistry, StreamWriter, STANDALONE_STREAM_ID};
use crate::protocol::{
    error_codes, headers as mcp_headers, methods, JsonRpcError, JsonRpcFrame, JsonRpcMessage,
    JsonRpcResponse, MessageContext, MessageHandler, SendOptions, Transport, TransportError,
};
use crate::transport::event_store::EventSink;

/// Shared state behind both the transport handle and the HTTP handler
struct ServerState {
    config: StreamableHttpServerConfig,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    session_id: RwLock<Option<String>>,
    initialized: AtomicBool,
    started: AtomicBool,
    closed: AtomicBool,
    close_notified: AtomicBool,
    registry: StreamRegistry,
}

impl ServerState {
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

    fn resumable(&self) -> bool {
        self.config.event_store.is_some()
    }

    async fn report_error(&self, error: TransportError) {
        if let Some(handler) = self.handler() {
            handler.handle_error(error).await;
        }
    }

    /// Fire `handle_close` at most once
    async fn notify_close(&self) {
        if self.close_notified.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handler) = self.handler() {
            handler.handle_close().await;
        }
    }

    async fn close_session(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registry.close_all();
        self.notify_close().await;
    }
}

/// Sink adapter writing replayed events into a live SSE channel
struct ChannelSink {
    tx: mpsc::Sender<SseFrame>,
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(
        &mut self,
        event_id: &str,
        message: &JsonRpcMessage,
    ) -> Result<(), TransportError> {
        self.tx
            .send(SseFrame {
                event_id: Some(event_id.to_string()),
                message: message.clone(),
            })
            .await
            .map_err(|_| TransportError::connection("client disconnected during replay"))
    }
}

/// Build a JSON-RPC error body response, echoing the session header
fn error_response(
    status: StatusCode,
    code: i32,
    message: &str,
    session_id: Option<&str>,
) -> Response {
    let body = JsonRpcResponse::error(JsonRpcError::new(code, message, None), None);
    let mut response = (status, Json(body)).into_response();
    attach_session_header(&mut response, session_id);
    response
}

fn attach_session_header(response: &mut Response, session_id: Option<&str>) {
    if let Some(session_id) = session_id {
        if let Ok(value) = HeaderValue::from_str(session_id) {
            response
                .headers_mut()
                .insert(mcp_headers::MCP_SESSION_ID, value);
        }
    }
}

/// Every value of a (possibly repeated) header, lossily decoded
fn header_values<'a>(headers: &'a HeaderMap, name: &str) -> Vec<&'a str> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect()
}

fn accept_includes(headers: &HeaderMap, content_type: &str) -> bool {
    header_values(headers, header::ACCEPT.as_str())
        .iter()
        .any(|value| value.contains(content_type))
}

/// Streamable HTTP server transport
///
/// Create one per session endpoint, wire [`Self::router`] (or
/// [`Self::handle`]) into your HTTP server, and attach a protocol engine.
/// The transport is the session: DELETE or `close()` ends it.
///
/// # Examples
///
/// ```rust,no_run
/// use tether_mcp::transport::streamable::{
///     StreamableHttpServerConfig, StreamableHttpServerTransport,
/// };
///
/// let transport = StreamableHttpServerTransport::new(StreamableHttpServerConfig::new());
/// let app: axum::Router = transport.router("/mcp");
/// ```
pub struct StreamableHttpServerTransport {
    inner: Arc<ServerState>,
}

/// Cloneable HTTP entry point for a [`StreamableHttpServerTransport`]
#[derive(Clone)]
pub struct StreamableHttpHandler {
    inner: Arc<ServerState>,
}

impl StreamableHttpServerTransport {
    /// Create a transport with the given configuration
    pub fn new(config: StreamableHttpServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerState {
                config,
                handler: RwLock::new(None),
                session_id: RwLock::new(None),
                initialized: AtomicBool::new(false),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                close_notified: AtomicBool::new(false),
                registry: StreamRegistry::new(),
            }),
        }
    }

    /// A cloneable handle for routing HTTP requests into this transport
    pub fn handle(&self) -> StreamableHttpHandler {
        StreamableHttpHandler {
            inner: Arc::clone(&self.inner),
        }
    }

    /// An axum router serving this transport at `path`
    pub fn router(&self, path: &str) -> Router {
        let handler = self.handle();
        Router::new()
            .route(
                path,
                any(move |request: Request| {
                    let handler = handler.clone();
                    async move { handler.handle(request).await }
                }),
            )
            .layer(TraceLayer::new_for_http())
    }
}

impl StreamableHttpHandler {
    /// Route one HTTP request
    pub async fn handle(&self, request: Request) -> Response {
        let method = request.method().clone();
        if method == Method::POST {
            self.handle_post(request).await
        } else if method == Method::GET {
            self.handle_get(request).await
        } else if method == Method::DELETE {
            self.handle_delete(request).await
        } else {
            let mut response = StatusCode::METHOD_NOT_ALLOWED.into_response();
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static("GET, POST, DELETE"));
            response
        }
    }

    /// Session gate applied to non-initialization requests
    ///
    /// Stateless servers (no session id generator) skip the gate entirely.
    fn validate_session(&self, headers: &HeaderMap) -> Result<(), Response> {
        let state = &self.inner;
        if state.config.session_id_generator.is_none() {
            return Ok(());
        }
        if state.closed.load(Ordering::Acquire) {
            return Err(error_response(
                StatusCode::NOT_FOUND,
                error_codes::SESSION_NOT_FOUND,
                "Session not found",
                None,
            ));
        }
        if !state.initialized.load(Ordering::Acquire) {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                error_codes::SERVER_ERROR,
                "Bad Request: Server not initialized",
                None,
            ));
        }
        let Some(session_id) = state.session_id() else {
            return Ok(());
        };

        let presented = header_values(headers, mcp_headers::MCP_SESSION_ID);
        match presented.as_slice() {
            [] => Err(error_response(
                StatusCode::BAD_REQUEST,
                error_codes::SERVER_ERROR,
                "Bad Request: Mcp-Session-Id header is required",
                Some(&session_id),
            )),
            [value] if *value == session_id => Ok(()),
            [_] => Err(error_response(
                StatusCode::NOT_FOUND,
                error_codes::SESSION_NOT_FOUND,
                "Session not found",
                Some(&session_id),
            )),
            _ => Err(error_response(
                StatusCode::BAD_REQUEST,
                error_codes::SERVER_ERROR,
                "Bad Request: Mcp-Session-Id header must be a single value",
                Some(&session_id),
            )),
        }
    }

    async fn handle_post(&self, request: Request) -> Response {
        let state = Arc::clone(&self.inner);

        if !accept_includes(request.headers(), "application/json")
            || !accept_includes(request.headers(), "text/event-stream")
        {
            return error_response(
                StatusCode::NOT_ACCEPTABLE,
                error_codes::SERVER_ERROR,
                "Not Acceptable: Client must accept both application/json and text/event-stream",
                state.session_id().as_deref(),
            );
        }

        let content_type_ok = header_values(request.headers(), header::CONTENT_TYPE.as_str())
            .iter()
            .any(|value| value.contains("application/json"));
        if !content_type_ok {
            return error_response(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                error_codes::SERVER_ERROR,
                "Unsupported Media Type: Content-Type must be application/json",
                state.session_id().as_deref(),
            );
        }

        let request_headers = request.headers().clone();
        let body = match to_bytes(request.into_body(), state.config.max_body_bytes).await {
            Ok(body) => body,
            Err(e) => {
                state
                    .report_error(TransportError::protocol(format!("body read failed: {e}")))
                    .await;
                return error_response(
                    StatusCode::BAD_REQUEST,
                    error_codes::PARSE_ERROR,
                    "Parse error",
                    state.session_id().as_deref(),
                );
            }
        };

        let frame = match JsonRpcFrame::from_slice(&body) {
            Ok(frame) => frame,
            Err(e) => {
                let status = StatusCode::BAD_REQUEST;
                let code = e.json_rpc_code();
                let detail = e.to_string();
                state.report_error(TransportError::protocol(detail)).await;
                let message = if code == error_codes::PARSE_ERROR {
                    "Parse error"
                } else {
                    "Invalid Request"
                };
                return error_response(status, code, message, state.session_id().as_deref());
            }
        };

        let is_initialization = frame
            .messages()
            .any(|m| m.method() == Some(methods::INITIALIZE));

        if is_initialization {
            if state.closed.load(Ordering::Acquire) {
                return error_response(
                    StatusCode::NOT_FOUND,
                    error_codes::SESSION_NOT_FOUND,
                    "Session not found",
                    None,
                );
            }
            if state.initialized.load(Ordering::Acquire) {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    error_codes::INVALID_REQUEST,
                    "Invalid Request: Server already initialized",
                    state.session_id().as_deref(),
                );
            }
            if frame.messages().count() > 1 {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    error_codes::INVALID_REQUEST,
                    "Invalid Request: Only one initialization request is allowed",
                    None,
                );
            }
            if let Some(generator) = &state.config.session_id_generator {
                let session_id = generator();
                debug!(session_id, "session created");
                *state
                    .session_id
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(session_id);
            }
            state.initialized.store(true, Ordering::Release);
        } else if let Err(response) = self.validate_session(&request_headers) {
            return response;
        }

        let session_id = state.session_id();

        if !frame.contains_request() {
            // Notifications and responses only: acknowledge and dispatch.
            dispatch_frame(Arc::clone(&state), frame.into_messages());
            let mut response = StatusCode::ACCEPTED.into_response();
            attach_session_header(&mut response, session_id.as_deref());
            return response;
        }

        let request_ids = frame.request_ids();
        if state.registry.any_request_registered(&request_ids) {
            return error_response(
                StatusCode::BAD_REQUEST,
                error_codes::INVALID_REQUEST,
                "Invalid Request: Request id is already in use",
                session_id.as_deref(),
            );
        }

        let stream_id = Uuid::new_v4().simple().to_string();
        let expects_batch = frame.is_batch();

        if state.config.enable_json_response {
            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            state
                .registry
                .register_json_stream(&stream_id, reply_tx, request_ids, expects_batch);
            dispatch_frame(Arc::clone(&state), frame.into_messages());

            match reply_rx.await {
                Ok(responses) => {
                    let body = if expects_batch {
                        match serde_json::to_value(&responses) {
                            Ok(value) => value,
                            Err(e) => {
                                return error_response(
                                    StatusCode::INTERNAL_SERVER_ERROR,
                                    error_codes::INTERNAL_ERROR,
                                    &format!("Internal error: {e}"),
                                    session_id.as_deref(),
                                )
                            }
                        }
                    } else {
                        match responses.into_iter().next().map(serde_json::to_value) {
                            Some(Ok(value)) => value,
                            _ => {
                                return error_response(
                                    StatusCode::INTERNAL_SERVER_ERROR,
                                    error_codes::INTERNAL_ERROR,
                                    "Internal error: missing response",
                                    session_id.as_deref(),
                                )
                            }
                        }
                    };
                    let mut response = (StatusCode::OK, Json(body)).into_response();
                    attach_session_header(&mut response, session_id.as_deref());
                    response
                }
                Err(_) => error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    error_codes::INTERNAL_ERROR,
                    "Internal error: session closed before responses completed",
                    session_id.as_deref(),
                ),
            }
        } else {
            let (tx, rx) = mpsc::channel(state.config.stream_channel_capacity);
            state
                .registry
                .register_sse_stream(&stream_id, tx.clone(), request_ids);
            spawn_disconnect_watch(Arc::clone(&state), stream_id.clone(), tx);
            dispatch_frame(Arc::clone(&state), frame.into_messages());
            sse_response(rx, session_id.as_deref())
        }
    }

    async fn handle_get(&self, request: Request) -> Response {
        let state = Arc::clone(&self.inner);

        if !accept_includes(request.headers(), "text/event-stream") {
            return error_response(
                StatusCode::NOT_ACCEPTABLE,
                error_codes::SERVER_ERROR,
                "Not Acceptable: Client must accept text/event-stream",
                state.session_id().as_deref(),
            );
        }
        if let Err(response) = self.validate_session(request.headers()) {
            return response;
        }
        let session_id = state.session_id();

        let last_event_id = request
            .headers()
            .get(mcp_headers::LAST_EVENT_ID)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        if let (Some(last_event_id), Some(store)) =
            (last_event_id, state.config.event_store.clone())
        {
            // Replay mode: stream the stored tail, then reattach the
            // recovered stream so new events continue on this response.
            let (tx, rx) = mpsc::channel(state.config.stream_channel_capacity);
            let replay_state = Arc::clone(&state);
            tokio::spawn(async move {
                let mut sink = ChannelSink { tx: tx.clone() };
                match store.replay_events_after(&last_event_id, &mut sink).await {
                    Ok(stream_id) => {
                        replay_state.registry.reattach(&stream_id, tx.clone());
                        spawn_disconnect_watch(replay_state, stream_id, tx);
                    }
                    Err(e) => {
                        warn!(last_event_id, "replay failed: {e}");
                        replay_state
                            .report_error(TransportError::protocol(format!("replay failed: {e}")))
                            .await;
                        // Dropping tx ends the response stream.
                    }
                }
            });
            return sse_response(rx, session_id.as_deref());
        }

        let (tx, rx) = mpsc::channel(state.config.stream_channel_capacity);
        if !state.registry.register_standalone(tx.clone()) {
            return error_response(
                StatusCode::CONFLICT,
                error_codes::SERVER_ERROR,
                "Conflict: Only one SSE stream is allowed per session",
                session_id.as_deref(),
            );
        }
        debug!("standalone stream opened");
        spawn_disconnect_watch(state, STANDALONE_STREAM_ID.to_string(), tx);
        sse_response(rx, session_id.as_deref())
    }

    async fn handle_delete(&self, request: Request) -> Response {
        let state = Arc::clone(&self.inner);

        // A second DELETE of the same session stays a success.
        if state.closed.load(Ordering::Acquire) {
            return StatusCode::OK.into_response();
        }
        if let Err(response) = self.validate_session(request.headers()) {
            return response;
        }

        let session_id = state.session_id();
        debug!(session_id = session_id.as_deref(), "session terminated");
        state.close_session().await;
        let mut response = StatusCode::OK.into_response();
        attach_session_header(&mut response, session_id.as_deref());
        response
    }
}

/// Deliver a frame's messages to the application, in wire order
fn dispatch_frame(state: Arc<ServerState>, messages: Vec<JsonRpcMessage>) {
    tokio::spawn(async move {
        let Some(handler) = state.handler() else {
            warn!("dropping inbound messages: no handler attached");
            return;
        };
        let session_id = state.session_id();
        for message in messages {
            let context = match &session_id {
                Some(session_id) => MessageContext::new(session_id.clone()),
                None => MessageContext::without_session(),
            };
            handler.handle_message(message, context).await;
        }
    });
}

/// Remove a stream's registration when its client goes away
fn spawn_disconnect_watch(state: Arc<ServerState>, stream_id: String, tx: mpsc::Sender<SseFrame>) {
    tokio::spawn(async move {
        tx.closed().await;
        trace!(stream_id, "stream peer disconnected");
        state.registry.on_disconnect(&stream_id, state.resumable());
    });
}

/// Build the SSE response around a frame channel
fn sse_response(rx: mpsc::Receiver<SseFrame>, session_id: Option<&str>) -> Response {
    let stream = ReceiverStream::new(rx).map(|frame| {
        let mut event = Event::default().event("message");
        if let Some(id) = frame.event_id {
            event = event.id(id);
        }
        event.json_data(&frame.message)
    });

    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    attach_session_header(&mut response, session_id);
    response
}

impl ServerState {
    /// Outbound routing for [`Transport::send_with_options`]
    async fn send_message(
        &self,
        message: JsonRpcMessage,
        options: SendOptions,
    ) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::connection("transport closed"));
        }

        let target = match message.response_id() {
            Some(id) => Some(id.clone()),
            None => options.related_request_id,
        };

        match target {
            Some(request_id) => self.send_to_request_stream(request_id, message).await,
            None => self.send_to_standalone(message).await,
        }
    }

    async fn send_to_standalone(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        if message.is_response() {
            return Err(TransportError::protocol(
                "responses cannot be sent on the standalone stream",
            ));
        }
        let Some(writer) = self.registry.writer(STANDALONE_STREAM_ID) else {
            // The server MAY send unsolicited messages; with no open
            // standalone stream they are dropped.
            trace!("no standalone stream open, dropping message");
            return Ok(());
        };

        let event_id = match &self.config.event_store {
            Some(store) => match store.store_event(STANDALONE_STREAM_ID, &message).await {
                Ok(event_id) => Some(event_id),
                Err(e) => {
                    self.registry.remove_live(STANDALONE_STREAM_ID);
                    self.report_error(TransportError::protocol(format!(
                        "event store write failed: {e}"
                    )))
                    .await;
                    return Err(TransportError::protocol("event store write failed"));
                }
            },
            None => None,
        };

        if let StreamWriter::Sse { tx } = writer.as_ref() {
            if tx.send(SseFrame { event_id, message }).await.is_err() {
                self.registry.remove_live(STANDALONE_STREAM_ID);
            }
        }
        Ok(())
    }

    async fn send_to_request_stream(
        &self,
        request_id: crate::protocol::RequestId,
        message: JsonRpcMessage,
    ) -> Result<(), TransportError> {
        let stream_id = self
            .registry
            .stream_for_request(&request_id)
            .ok_or_else(|| {
                TransportError::protocol(format!(
                    "no stream registered for request id {request_id}"
                ))
            })?;

        let writer = self.registry.writer(&stream_id);
        match writer.as_deref() {
            Some(StreamWriter::Json { reply, .. }) => {
                if !message.is_response() {
                    // A buffered JSON body has no slot for in-flight
                    // notifications.
                    trace!(stream_id, "dropping non-response message in JSON mode");
                    return Ok(());
                }
                if let Some(completed) = self.registry.record_response(&request_id, message) {
                    if let Some(reply_tx) = reply.lock().await.take() {
                        let _ = reply_tx.send(completed.responses);
                    }
                    self.registry.remove_live(&stream_id);
                }
                Ok(())
            }
            Some(StreamWriter::Sse { tx }) => {
                let event_id = match &self.config.event_store {
                    Some(store) => match store.store_event(&stream_id, &message).await {
                        Ok(event_id) => Some(event_id),
                        Err(e) => {
                            self.registry.on_disconnect(&stream_id, self.resumable());
                            self.report_error(TransportError::protocol(format!(
                                "event store write failed: {e}"
                            )))
                            .await;
                            return Err(TransportError::protocol("event store write failed"));
                        }
                    },
                    None => None,
                };

                let is_response = message.is_response();
                if tx.send(SseFrame { event_id, message: message.clone() }).await.is_err() {
                    self.registry.remove_live(&stream_id);
                }
                if is_response {
                    if self
                        .registry
                        .record_response(&request_id, message)
                        .is_some()
                    {
                        // Every owning request answered: end the stream.
                        self.registry.remove_live(&stream_id);
                    }
                }
                Ok(())
            }
            None => {
                // Disconnected but still registered (resumable session):
                // persist so a replay covers this message, and keep the
                // completion accounting moving.
                let event_id = match &self.config.event_store {
                    Some(store) => store
                        .store_event(&stream_id, &message)
                        .await
                        .map(Some)
                        .map_err(|e| {
                            TransportError::protocol(format!("event store write failed: {e}"))
                        })?,
                    None => None,
                };
                trace!(
                    stream_id,
                    ?event_id,
                    "stored message for disconnected stream"
                );
                if message.is_response() {
                    self.registry.record_response(&request_id, message);
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Transport for StreamableHttpServerTransport {
    type Error = TransportError;

    fn set_message_handler(&mut self, handler: Arc<dyn MessageHandler>) {
        *self
            .inner
            .handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handler);
    }

    async fn start(&mut self) -> Result<(), Self::Error> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(TransportError::connection("transport already started"));
        }
        if self.inner.handler().is_none() {
            self.inner.started.store(false, Ordering::Release);
            return Err(TransportError::connection("no message handler configured"));
        }
        Ok(())
    }

    async fn send_with_options(
        &mut self,
        message: JsonRpcMessage,
        options: SendOptions,
    ) -> Result<(), Self::Error> {
        self.inner.send_message(message, options).await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.inner.close_session().await;
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.inner.session_id()
    }

    fn is_connected(&self) -> bool {
        self.inner.started.load(Ordering::Acquire) && !self.inner.closed.load(Ordering::Acquire)
    }

    fn transport_type(&self) -> &'static str {
        "streamable-http"
    }
}
