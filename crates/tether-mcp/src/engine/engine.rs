//! Protocol Engine
//!
//! One engine owns one transport and turns it into a request/response
//! endpoint: outbound requests get correlated waiters with timeout,
//! progress and cancellation support; inbound requests dispatch to a
//! method-keyed handler registry under per-request cancellation tokens;
//! inbound notifications route to their handlers without ever breaking
//! the stream.
//!
//! Built-in behavior: `ping` auto-replies with an empty result,
//! `notifications/cancelled` aborts the matching inbound handler, and
//! `notifications/progress` routes to the registered progress callback.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

// Layer 3: Internal module imports
use super::error::EngineError;
use super::handshake::ServerIdentity;
use super::pending::{PendingRequest, ProgressCallback, ProgressEntry, RequestIdGenerator};
use crate::protocol::{
    defaults, methods, CancelledParams, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    McpError, MessageContext, MessageHandler, ProgressParams, RequestId, SendOptions, Transport,
    TransportError,
};

/// Engine-wide options
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Refuse to send requests whose method requires a capability the
    /// peer did not advertise
    pub strict_capabilities: bool,
}

/// Per-request options for [`ProtocolEngine::request`]
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Time allowed before the request fails with `RequestTimeout`;
    /// `None` waits forever. The default is 60 seconds.
    pub timeout: Option<Duration>,

    /// Restart the timeout clock whenever a progress notification for
    /// this request arrives
    pub reset_timeout_on_progress: bool,

    /// Hard ceiling on the total wait; never extended by progress
    pub max_total_timeout: Option<Duration>,

    /// Progress callback; also attaches `_meta.progressToken`
    pub on_progress: Option<ProgressCallback>,

    /// Abort signal: fires a `notifications/cancelled` and rejects locally
    pub cancellation: Option<CancellationToken>,

    /// Reason string carried by the cancellation notification
    pub cancellation_reason: Option<String>,
}

impl RequestOptions {
    /// Options with the default timeout
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Disable the per-request timeout
    pub fn no_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Reset the timeout clock on progress notifications
    pub fn reset_timeout_on_progress(mut self, enabled: bool) -> Self {
        self.reset_timeout_on_progress = enabled;
        self
    }

    /// Hard ceiling on the total wait
    pub fn max_total_timeout(mut self, timeout: Duration) -> Self {
        self.max_total_timeout = Some(timeout);
        self
    }

    /// Attach a progress callback
    pub fn on_progress(mut self, callback: impl Fn(ProgressParams) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    /// Attach a cancellation signal and the reason it will carry
    pub fn cancellation(mut self, token: CancellationToken, reason: Option<String>) -> Self {
        self.cancellation = Some(token);
        self.cancellation_reason = reason;
        self
    }

    fn effective_timeout(&self) -> Option<Duration> {
        self.timeout.or(Some(defaults::REQUEST_TIMEOUT))
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("timeout", &self.timeout)
            .field("reset_timeout_on_progress", &self.reset_timeout_on_progress)
            .field("max_total_timeout", &self.max_total_timeout)
            .field("has_progress_callback", &self.on_progress.is_some())
            .field("has_cancellation", &self.cancellation.is_some())
            .finish()
    }
}

/// Context handed to inbound request handlers
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// The inbound request's id
    pub request_id: RequestId,
    /// Session identity of the carrying transport, when it has one
    pub session_id: Option<String>,
    /// Fires when the peer cancels this request; the eventual response is
    /// suppressed once it has fired
    pub cancellation: CancellationToken,
}

/// Handler for one inbound request method
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Produce the result for a request, or an error with a wire code
    async fn handle(&self, request: JsonRpcRequest, context: RequestContext)
        -> Result<Value, McpError>;
}

/// Handler for one inbound notification method
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// Consume a notification; errors are reported, never sent to the peer
    async fn handle(
        &self,
        notification: JsonRpcNotification,
        context: MessageContext,
    ) -> Result<(), McpError>;
}

struct FnRequestHandler<F> {
    function: F,
}

#[async_trait]
impl<F, Fut> RequestHandler for FnRequestHandler<F>
where
    F: Fn(JsonRpcRequest, RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, McpError>> + Send,
{
    async fn handle(
        &self,
        request: JsonRpcRequest,
        context: RequestContext,
    ) -> Result<Value, McpError> {
        (self.function)(request, context).await
    }
}

struct FnNotificationHandler<F> {
    function: F,
}

#[async_trait]
impl<F, Fut> NotificationHandler for FnNotificationHandler<F>
where
    F: Fn(JsonRpcNotification, MessageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), McpError>> + Send,
{
    async fn handle(
        &self,
        notification: JsonRpcNotification,
        context: MessageContext,
    ) -> Result<(), McpError> {
        (self.function)(notification, context).await
    }
}

/// Capability a method requires from the peer, if any
fn required_capability(method: &str) -> Option<&'static str> {
    let prefix = method.split_once('/').map(|(prefix, _)| prefix)?;
    match prefix {
        "tools" => Some("tools"),
        "resources" => Some("resources"),
        "prompts" => Some("prompts"),
        "logging" => Some("logging"),
        "sampling" => Some("sampling"),
        "roots" => Some("roots"),
        "completion" => Some("completions"),
        _ => None,
    }
}

type WorkerItem = (JsonRpcMessage, MessageContext);

/// State shared between the engine handle, its transport callbacks, and
/// the inbound worker
struct EngineShared<T: Transport> {
    transport: Mutex<Option<T>>,
    options: EngineOptions,
    id_generator: RequestIdGenerator,
    pending: DashMap<RequestId, PendingRequest>,
    progress: DashMap<RequestId, ProgressEntry>,
    inbound: DashMap<RequestId, CancellationToken>,
    request_handlers: HashMap<String, Arc<dyn RequestHandler>>,
    notification_handlers: HashMap<String, Arc<dyn NotificationHandler>>,
    fallback_request_handler: Option<Arc<dyn RequestHandler>>,
    fallback_notification_handler: Option<Arc<dyn NotificationHandler>>,
    server_identity: Option<ServerIdentity>,
    peer_capabilities: std::sync::RwLock<Option<Value>>,
    on_close: Option<Arc<dyn Fn() + Send + Sync>>,
    on_error: Option<Arc<dyn Fn(EngineError) + Send + Sync>>,
    worker_tx: std::sync::RwLock<Option<mpsc::UnboundedSender<WorkerItem>>>,
    connected: AtomicBool,
    close_handled: AtomicBool,
}

impl<T: Transport + 'static> EngineShared<T> {
    async fn send_raw(&self, message: JsonRpcMessage, options: SendOptions) -> Result<(), String> {
        let mut guard = self.transport.lock().await;
        match guard.as_mut() {
            Some(transport) => transport
                .send_with_options(message, options)
                .await
                .map_err(|e| e.to_string()),
            None => Err("not connected".to_string()),
        }
    }

    fn emit_error(&self, error: EngineError) {
        warn!("engine error: {error}");
        if let Some(on_error) = &self.on_error {
            on_error(error);
        }
    }

    fn cleanup_request(&self, id: &RequestId) {
        self.pending.remove(id);
        self.progress.remove(id);
    }

    fn peer_capabilities(&self) -> Option<Value> {
        self.peer_capabilities
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_peer_capabilities(&self, capabilities: Value) {
        *self
            .peer_capabilities
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(capabilities);
    }

    fn ensure_capability(&self, method: &str) -> Result<(), EngineError> {
        if !self.options.strict_capabilities {
            return Ok(());
        }
        let Some(capability) = required_capability(method) else {
            return Ok(());
        };
        match self.peer_capabilities() {
            Some(Value::Object(map)) if map.contains_key(capability) => Ok(()),
            _ => Err(EngineError::Protocol(McpError::invalid_request(format!(
                "peer does not advertise capability '{capability}' required by {method}"
            )))),
        }
    }

    /// Resolve a waiter with a response from the wire
    fn resolve_response(&self, response: crate::protocol::JsonRpcResponse) {
        let Some(id) = response.id.clone() else {
            self.emit_error(EngineError::Protocol(McpError::invalid_request(
                "response without id",
            )));
            return;
        };
        let Some((_, entry)) = self.pending.remove(&id) else {
            self.emit_error(EngineError::Protocol(McpError::invalid_request(format!(
                "response for unknown request id {id}"
            ))));
            return;
        };
        self.progress.remove(&id);

        let outcome = match response.error {
            Some(error) => Err(McpError::from(error)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = entry.responder.send(outcome);
    }

    /// Route a progress notification to its registered callback
    fn route_progress(&self, notification: JsonRpcNotification) {
        let params = notification.params.unwrap_or(Value::Null);
        let Ok(params) = serde_json::from_value::<ProgressParams>(params) else {
            self.emit_error(EngineError::Protocol(McpError::invalid_params(
                "malformed progress notification",
            )));
            return;
        };
        let id = match &params.progress_token {
            Value::Number(n) => n.as_i64().map(RequestId::Number),
            Value::String(s) => Some(RequestId::String(s.clone())),
            _ => None,
        };
        let Some(id) = id.filter(|id| self.progress.contains_key(id)) else {
            self.emit_error(EngineError::Protocol(McpError::invalid_params(format!(
                "progress for unknown token {}",
                params.progress_token
            ))));
            return;
        };
        // Tick the timeout-reset channel under the guard, but run the user
        // callback only after the guard is released.
        let callback = self.progress.get(&id).and_then(|entry| {
            let _ = entry.tick.send(());
            entry.callback.clone()
        });
        if let Some(callback) = callback {
            callback(params);
        }
    }

    /// Abort the inbound handler the peer cancelled
    fn route_cancelled(&self, notification: JsonRpcNotification) {
        let params = notification.params.unwrap_or(Value::Null);
        let Ok(params) = serde_json::from_value::<CancelledParams>(params) else {
            self.emit_error(EngineError::Protocol(McpError::invalid_params(
                "malformed cancelled notification",
            )));
            return;
        };
        if let Some(token) = self.inbound.get(&params.request_id) {
            debug!(
                request_id = %params.request_id,
                reason = params.reason.as_deref(),
                "inbound request cancelled by peer"
            );
            token.cancel();
        }
    }

    /// Tear down after the transport is gone; safe to call repeatedly
    fn on_transport_closed(&self) {
        if self.close_handled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connected.store(false, Ordering::Release);

        // Dropping the waiters resolves every in-flight request with a
        // connection-closed error on the caller side.
        self.pending.clear();
        self.progress.clear();
        for entry in self.inbound.iter() {
            entry.value().cancel();
        }
        self.inbound.clear();
        *self
            .worker_tx
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;

        if let Some(on_close) = &self.on_close {
            on_close();
        }
    }
}

/// Transport callback adapter feeding the engine
struct EngineHandler<T: Transport + 'static> {
    shared: Arc<EngineShared<T>>,
}

#[async_trait]
impl<T: Transport + 'static> MessageHandler for EngineHandler<T> {
    async fn handle_message(&self, message: JsonRpcMessage, context: MessageContext) {
        match message {
            JsonRpcMessage::Response(response) => self.shared.resolve_response(response),
            JsonRpcMessage::Notification(n) if n.method == methods::PROGRESS => {
                self.shared.route_progress(n);
            }
            JsonRpcMessage::Notification(n) if n.method == methods::CANCELLED => {
                self.shared.route_cancelled(n);
            }
            other => {
                // Requests and remaining notifications run on the worker so
                // user handlers never execute inside the transport's
                // delivery path.
                let tx = self
                    .shared
                    .worker_tx
                    .read()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clone();
                if let Some(tx) = tx {
                    let _ = tx.send((other, context));
                }
            }
        }
    }

    async fn handle_error(&self, error: TransportError) {
        self.shared.emit_error(EngineError::Transport {
            message: error.to_string(),
        });
    }

    async fn handle_close(&self) {
        self.shared.on_transport_closed();
    }
}

/// Builder for [`ProtocolEngine`]
#[derive(Default)]
pub struct EngineBuilder {
    request_handlers: HashMap<String, Arc<dyn RequestHandler>>,
    notification_handlers: HashMap<String, Arc<dyn NotificationHandler>>,
    fallback_request_handler: Option<Arc<dyn RequestHandler>>,
    fallback_notification_handler: Option<Arc<dyn NotificationHandler>>,
    server_identity: Option<ServerIdentity>,
    on_close: Option<Arc<dyn Fn() + Send + Sync>>,
    on_error: Option<Arc<dyn Fn(EngineError) + Send + Sync>>,
}

impl EngineBuilder {
    /// Register a request handler for `method`
    pub fn request_handler(
        mut self,
        method: impl Into<String>,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        self.request_handlers.insert(method.into(), handler);
        self
    }

    /// Register an async closure as the handler for `method`
    pub fn request_handler_fn<F, Fut>(self, method: impl Into<String>, function: F) -> Self
    where
        F: Fn(JsonRpcRequest, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, McpError>> + Send + 'static,
    {
        self.request_handler(method, Arc::new(FnRequestHandler { function }))
    }

    /// Register a notification handler for `method`
    pub fn notification_handler(
        mut self,
        method: impl Into<String>,
        handler: Arc<dyn NotificationHandler>,
    ) -> Self {
        self.notification_handlers.insert(method.into(), handler);
        self
    }

    /// Register an async closure as the notification handler for `method`
    pub fn notification_handler_fn<F, Fut>(self, method: impl Into<String>, function: F) -> Self
    where
        F: Fn(JsonRpcNotification, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), McpError>> + Send + 'static,
    {
        self.notification_handler(method, Arc::new(FnNotificationHandler { function }))
    }

    /// Handler for request methods with no specific registration
    pub fn fallback_request_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.fallback_request_handler = Some(handler);
        self
    }

    /// Handler for notification methods with no specific registration
    pub fn fallback_notification_handler(mut self, handler: Arc<dyn NotificationHandler>) -> Self {
        self.fallback_notification_handler = Some(handler);
        self
    }

    /// Act as a server: answer `initialize` with this identity, negotiating
    /// the protocol version
    pub fn server_identity(mut self, identity: ServerIdentity) -> Self {
        self.server_identity = Some(identity);
        self
    }

    /// Observe engine shutdown
    pub fn on_close(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(callback));
        self
    }

    /// Observe non-fatal engine errors
    pub fn on_error(mut self, callback: impl Fn(EngineError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Attach the transport and start it
    ///
    /// A transport is owned by exactly one engine; `connect` consumes it,
    /// which is what enforces the ownership invariant.
    pub async fn connect<T: Transport + 'static>(
        self,
        mut transport: T,
        options: EngineOptions,
    ) -> Result<ProtocolEngine<T>, EngineError> {
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(EngineShared {
            transport: Mutex::new(None),
            options,
            id_generator: RequestIdGenerator::new(),
            pending: DashMap::new(),
            progress: DashMap::new(),
            inbound: DashMap::new(),
            request_handlers: self.request_handlers,
            notification_handlers: self.notification_handlers,
            fallback_request_handler: self.fallback_request_handler,
            fallback_notification_handler: self.fallback_notification_handler,
            server_identity: self.server_identity,
            peer_capabilities: std::sync::RwLock::new(None),
            on_close: self.on_close,
            on_error: self.on_error,
            worker_tx: std::sync::RwLock::new(Some(worker_tx)),
            connected: AtomicBool::new(false),
            close_handled: AtomicBool::new(false),
        });

        transport.set_message_handler(Arc::new(EngineHandler {
            shared: Arc::clone(&shared),
        }));
        *shared.transport.lock().await = Some(transport);
        shared.connected.store(true, Ordering::Release);

        tokio::spawn(worker_loop(Arc::clone(&shared), worker_rx));

        // Start after everything is wired: messages arriving during start
        // already find the handler and the transport in place.
        {
            let mut guard = shared.transport.lock().await;
            if let Some(transport) = guard.as_mut() {
                transport.start().await.map_err(|e| EngineError::Transport {
                    message: e.to_string(),
                })?;
            }
        }

        Ok(ProtocolEngine { shared })
    }
}

/// Sequential inbound dispatcher
///
/// Notifications run here in arrival order; requests spawn their own
/// tasks so slow handlers cannot block the queue (or each other).
async fn worker_loop<T: Transport + 'static>(
    shared: Arc<EngineShared<T>>,
    mut rx: mpsc::UnboundedReceiver<WorkerItem>,
) {
    while let Some((message, context)) = rx.recv().await {
        match message {
            JsonRpcMessage::Request(request) => dispatch_request(&shared, request, context),
            JsonRpcMessage::Notification(notification) => {
                dispatch_notification(&shared, notification, context).await;
            }
            JsonRpcMessage::Response(_) => {}
        }
    }
}

fn dispatch_request<T: Transport + 'static>(
    shared: &Arc<EngineShared<T>>,
    request: JsonRpcRequest,
    context: MessageContext,
) {
    let id = request.id.clone();

    // Built-in: ping answers immediately with an empty result.
    if request.method == methods::PING {
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            send_response(&shared, id, Ok(json!({}))).await;
        });
        return;
    }

    // Built-in: initialize, when this engine was given a server identity.
    if request.method == methods::INITIALIZE {
        if let Some(identity) = shared.server_identity.clone() {
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                let result = match super::handshake::handle_initialize_request(&identity, &request)
                {
                    Ok(reply) => {
                        if let Some(capabilities) = reply.peer_capabilities {
                            shared.set_peer_capabilities(capabilities);
                        }
                        Ok(reply.result)
                    }
                    Err(error) => Err(error),
                };
                send_response(&shared, id, result).await;
            });
            return;
        }
    }

    let handler = shared
        .request_handlers
        .get(&request.method)
        .cloned()
        .or_else(|| shared.fallback_request_handler.clone());
    let Some(handler) = handler else {
        let method = request.method.clone();
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            send_response(&shared, id, Err(McpError::method_not_found(&method))).await;
        });
        return;
    };

    let token = CancellationToken::new();
    shared.inbound.insert(id.clone(), token.clone());
    let shared = Arc::clone(shared);

    tokio::spawn(async move {
        let request_context = RequestContext {
            request_id: id.clone(),
            session_id: context.session_id().map(str::to_string),
            cancellation: token.clone(),
        };

        let outcome = tokio::select! {
            _ = token.cancelled() => None,
            result = handler.handle(request, request_context) => Some(result),
        };
        shared.inbound.remove(&id);

        match outcome {
            // Cancelled: the response is suppressed.
            None => trace!(request_id = %id, "handler cancelled, response suppressed"),
            Some(result) => send_response(&shared, id, result).await,
        }
    });
}

async fn dispatch_notification<T: Transport + 'static>(
    shared: &Arc<EngineShared<T>>,
    notification: JsonRpcNotification,
    context: MessageContext,
) {
    let handler = shared
        .notification_handlers
        .get(&notification.method)
        .cloned()
        .or_else(|| shared.fallback_notification_handler.clone());

    match handler {
        Some(handler) => {
            let method = notification.method.clone();
            if let Err(error) = handler.handle(notification, context).await {
                shared.emit_error(EngineError::Protocol(McpError::new(
                    error.code,
                    format!("notification handler for {method} failed: {}", error.message),
                    error.data,
                )));
            }
        }
        None => trace!(method = notification.method, "unhandled notification"),
    }
}

async fn send_response<T: Transport + 'static>(
    shared: &Arc<EngineShared<T>>,
    id: RequestId,
    result: Result<Value, McpError>,
) {
    let message = match result {
        Ok(value) => JsonRpcMessage::response(value, id),
        Err(error) => JsonRpcMessage::error_response(error.into(), Some(id)),
    };
    if let Err(message) = shared.send_raw(message, SendOptions::default()).await {
        shared.emit_error(EngineError::Transport { message });
    }
}

/// Attach `_meta.progressToken` to a params object
fn attach_progress_token(params: Option<Value>, id: &RequestId) -> Option<Value> {
    let token = match id {
        RequestId::Number(n) => json!(n),
        RequestId::String(s) => json!(s),
    };
    let mut object = match params {
        Some(Value::Object(map)) => map,
        None => Map::new(),
        // Array params have no place for _meta; leave them untouched.
        Some(other) => return Some(other),
    };
    let meta = object
        .entry("_meta".to_string())
        .or_insert_with(|| json!({}));
    if let Some(map) = meta.as_object_mut() {
        map.insert("progressToken".to_string(), token);
    }
    Some(Value::Object(object))
}

/// Bidirectional JSON-RPC endpoint over one transport
///
/// Cloning the engine clones the handle, not the endpoint: all clones
/// share the same transport and request tables.
pub struct ProtocolEngine<T: Transport + 'static> {
    shared: Arc<EngineShared<T>>,
}

impl<T: Transport + 'static> Clone for ProtocolEngine<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport + 'static> ProtocolEngine<T> {
    /// Start configuring an engine
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// True while the transport is attached and open
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Session id of the underlying transport, when it has one
    pub async fn session_id(&self) -> Option<String> {
        let guard = self.shared.transport.lock().await;
        guard.as_ref().and_then(|transport| transport.session_id())
    }

    /// The peer's advertised capabilities, once known
    pub fn peer_capabilities(&self) -> Option<Value> {
        self.shared.peer_capabilities()
    }

    /// Record the peer's capabilities (done by the handshake)
    pub fn set_peer_capabilities(&self, capabilities: Value) {
        self.shared.set_peer_capabilities(capabilities);
    }

    /// Send a request and wait for its single resolution
    ///
    /// Every call ends in exactly one of: the peer's result, the peer's
    /// error, a local timeout, a local cancellation, or a
    /// connection-closed error.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value, EngineError> {
        let shared = &self.shared;
        if !shared.connected.load(Ordering::Acquire) {
            return Err(EngineError::NotConnected);
        }
        shared.ensure_capability(method)?;

        let id = shared.id_generator.next();
        let wants_progress = options.on_progress.is_some() || options.reset_timeout_on_progress;

        let mut params = params;
        let mut tick_rx: Option<watch::Receiver<()>> = None;
        if wants_progress {
            let (tick_tx, rx) = watch::channel(());
            shared.progress.insert(
                id.clone(),
                ProgressEntry {
                    callback: options.on_progress.clone(),
                    tick: tick_tx,
                },
            );
            tick_rx = Some(rx);
            params = attach_progress_token(params, &id);
        }

        let (responder, mut receiver) = oneshot::channel();
        shared
            .pending
            .insert(id.clone(), PendingRequest { responder });

        let message = JsonRpcMessage::request(method, params, id.clone());
        if let Err(send_error) = shared.send_raw(message, SendOptions::default()).await {
            shared.cleanup_request(&id);
            return Err(EngineError::Transport {
                message: send_error,
            });
        }

        let started = Instant::now();
        let timeout = options.effective_timeout();
        let mut deadline = timeout.map(|t| started + t);
        let max_deadline = options.max_total_timeout.map(|t| started + t);
        let cancel = options
            .cancellation
            .clone()
            .unwrap_or_else(CancellationToken::new);
        let far_future = started + Duration::from_secs(60 * 60 * 24 * 365);

        loop {
            let effective_deadline = match (deadline, max_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (Some(a), None) => Some(a),
                (None, b) => b,
            };
            let progress_enabled = tick_rx.is_some() && options.reset_timeout_on_progress;

            tokio::select! {
                result = &mut receiver => {
                    return match result {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(error)) => Err(EngineError::Protocol(error)),
                        Err(_) => Err(EngineError::ConnectionClosed),
                    };
                }

                _ = cancel.cancelled(), if options.cancellation.is_some() => {
                    shared.cleanup_request(&id);
                    self.send_cancelled_notification(&id, options.cancellation_reason.clone())
                        .await;
                    return Err(EngineError::Cancelled {
                        reason: options.cancellation_reason.clone(),
                    });
                }

                _ = tokio::time::sleep_until(effective_deadline.unwrap_or(far_future)),
                    if effective_deadline.is_some() =>
                {
                    shared.cleanup_request(&id);
                    self.send_cancelled_notification(&id, Some("timeout".to_string()))
                        .await;
                    return Err(EngineError::RequestTimeout {
                        method: method.to_string(),
                    });
                }

                changed = async {
                    match tick_rx.as_mut() {
                        Some(rx) => rx.changed().await.is_ok(),
                        None => false,
                    }
                }, if progress_enabled => {
                    if changed {
                        if let Some(timeout) = timeout {
                            // max_total_timeout still caps the wait via
                            // effective_deadline above.
                            deadline = Some(Instant::now() + timeout);
                        }
                    } else {
                        tick_rx = None;
                    }
                }
            }
        }
    }

    async fn send_cancelled_notification(&self, id: &RequestId, reason: Option<String>) {
        let params = CancelledParams {
            request_id: id.clone(),
            reason,
        };
        let params = match serde_json::to_value(&params) {
            Ok(value) => value,
            Err(_) => return,
        };
        let message = JsonRpcMessage::notification(methods::CANCELLED, Some(params));
        if let Err(message) = self
            .shared
            .send_raw(message, SendOptions::default())
            .await
        {
            debug!("failed to send cancellation notification: {message}");
        }
    }

    /// Send a notification
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), EngineError> {
        self.notify_with_options(method, params, SendOptions::default())
            .await
    }

    /// Send a notification with carrier options (e.g. routing it onto the
    /// stream of a request being served)
    pub async fn notify_with_options(
        &self,
        method: &str,
        params: Option<Value>,
        options: SendOptions,
    ) -> Result<(), EngineError> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(EngineError::NotConnected);
        }
        let message = JsonRpcMessage::notification(method, params);
        self.shared
            .send_raw(message, options)
            .await
            .map_err(|message| EngineError::Transport { message })
    }

    /// Send a progress notification for a request this engine is serving
    pub async fn notify_progress(
        &self,
        token: Value,
        progress: f64,
        total: Option<f64>,
        related_request_id: RequestId,
    ) -> Result<(), EngineError> {
        let params = ProgressParams {
            progress_token: token,
            progress,
            total,
            message: None,
        };
        self.notify_with_options(
            methods::PROGRESS,
            Some(serde_json::to_value(&params)?),
            SendOptions::related_to(related_request_id),
        )
        .await
    }

    /// Close the transport and fail every in-flight request with
    /// `ConnectionClosed`
    pub async fn close(&self) -> Result<(), EngineError> {
        let result = {
            let mut guard = self.shared.transport.lock().await;
            match guard.as_mut() {
                Some(transport) => transport.close().await.map_err(|e| EngineError::Transport {
                    message: e.to_string(),
                }),
                None => Ok(()),
            }
        };
        self.shared.on_transport_closed();
        result
    }
}
