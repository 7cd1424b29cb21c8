//! Stdio Transport Implementation
//!
//! Frames one JSON-RPC message per line. A line buffer accumulates bytes
//! until `\n`, then parses; a line that fails to parse surfaces through
//! `handle_error` without aborting the stream, because a peer bug in one
//! frame must not kill the session. Embedded newlines inside JSON strings
//! are harmless — the encoder escapes them.

// Layer 1: Standard library imports
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin, Stdout};
use tokio::sync::broadcast;
use tracing::debug;

// Layer 3: Internal module imports
use crate::protocol::{
    JsonRpcMessage, MessageContext, MessageHandler, SendOptions, Transport, TransportError,
    WireFormat,
};

/// Default stdin type for production use
pub type DefaultStdin = BufReader<Stdin>;

/// Default stdout type for production use
pub type DefaultStdout = Stdout;

/// Fire `handle_close` at most once for a transport
pub(super) async fn notify_close_once(handler: &Arc<dyn MessageHandler>, notified: &AtomicBool) {
    if !notified.swap(true, Ordering::AcqRel) {
        handler.handle_close().await;
    }
}

/// Read newline-delimited frames until EOF or shutdown
///
/// Shared by the server transport (process stdin) and the client transport
/// (child stdout). Parse failures surface via `handle_error` and the loop
/// continues; EOF and shutdown both end in a single `handle_close`.
pub(super) async fn reader_loop<R>(
    mut reader: R,
    handler: Arc<dyn MessageHandler>,
    session_id: String,
    mut shutdown_rx: broadcast::Receiver<()>,
    close_notified: Arc<AtomicBool>,
) where
    R: AsyncBufReadExt + Unpin + Send + 'static,
{
    let mut line = String::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                notify_close_once(&handler, &close_notified).await;
                break;
            }

            result = reader.read_line(&mut line) => {
                match result {
                    Ok(0) => {
                        debug!(session_id, "stdio reader reached EOF");
                        notify_close_once(&handler, &close_notified).await;
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim();
                        if !trimmed.is_empty() {
                            match JsonRpcMessage::from_json(trimmed) {
                                Ok(message) => {
                                    let context = MessageContext::new(session_id.clone());
                                    handler.handle_message(message, context).await;
                                }
                                Err(e) => {
                                    handler
                                        .handle_error(TransportError::Serialization { source: e })
                                        .await;
                                }
                            }
                        }
                        line.clear();
                    }
                    Err(e) => {
                        handler.handle_error(TransportError::Io { source: e }).await;
                        notify_close_once(&handler, &close_notified).await;
                        break;
                    }
                }
            }
        }
    }
}

/// Generic stdio transport
///
/// Reads JSON-RPC frames from a reader and writes frames to a writer; the
/// defaults are this process's stdin/stdout, which is the server side of a
/// stdio MCP connection. The generics exist so tests can substitute
/// in-memory streams.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tether_mcp::protocol::{
///     JsonRpcMessage, MessageContext, MessageHandler, Transport, TransportError,
/// };
/// use tether_mcp::transport::stdio::StdioTransportBuilder;
/// use async_trait::async_trait;
///
/// struct EchoHandler;
///
/// #[async_trait]
/// impl MessageHandler for EchoHandler {
///     async fn handle_message(&self, message: JsonRpcMessage, _context: MessageContext) {}
///     async fn handle_error(&self, _error: TransportError) {}
///     async fn handle_close(&self) {}
/// }
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut transport = StdioTransportBuilder::new()
///     .with_message_handler(Arc::new(EchoHandler))
///     .build()
///     .await?;
/// transport.start().await?;
/// transport.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct StdioTransport<R = DefaultStdin, W = DefaultStdout>
where
    R: AsyncBufReadExt + Unpin + Send + Sync + 'static,
    W: AsyncWriteExt + Unpin + Send + Sync + 'static,
{
    message_handler: Option<Arc<dyn MessageHandler>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
    session_id: String,
    is_running: bool,
    close_notified: Arc<AtomicBool>,
    reader: Option<R>,
    writer: Option<W>,
}

impl StdioTransport<DefaultStdin, DefaultStdout> {
    /// Create a production transport over this process's stdin/stdout
    pub fn new() -> Self {
        Self {
            message_handler: None,
            shutdown_tx: None,
            task_handle: None,
            session_id: "stdio".to_string(),
            is_running: false,
            close_notified: Arc::new(AtomicBool::new(false)),
            reader: None,
            writer: None,
        }
    }
}

impl Default for StdioTransport<DefaultStdin, DefaultStdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncBufReadExt + Unpin + Send + Sync + 'static,
    W: AsyncWriteExt + Unpin + Send + Sync + 'static,
{
    /// Wait for the background reader task to finish
    ///
    /// Returns once the reader reaches EOF or shutdown; useful for servers
    /// whose lifetime is "until the client hangs up".
    pub async fn wait_for_completion(&mut self) -> Result<(), TransportError> {
        if let Some(task_handle) = self.task_handle.take() {
            task_handle
                .await
                .map_err(|e| TransportError::connection(format!("reader task failed: {e}")))?;
            self.is_running = false;
        }
        Ok(())
    }
}

impl<R, W> Debug for StdioTransport<R, W>
where
    R: AsyncBufReadExt + Unpin + Send + Sync + 'static,
    W: AsyncWriteExt + Unpin + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("session_id", &self.session_id)
            .field("is_running", &self.is_running)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<R, W> Transport for StdioTransport<R, W>
where
    R: AsyncBufReadExt + Unpin + Send + Sync + 'static,
    W: AsyncWriteExt + Unpin + Send + Sync + 'static,
{
    type Error = TransportError;

    fn set_message_handler(&mut self, handler: Arc<dyn MessageHandler>) {
        self.message_handler = Some(handler);
    }

    async fn start(&mut self) -> Result<(), Self::Error> {
        if self.is_running {
            return Err(TransportError::connection("transport already started"));
        }
        let handler = self
            .message_handler
            .as_ref()
            .ok_or_else(|| TransportError::connection("no message handler configured"))?
            .clone();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);
        let session_id = self.session_id.clone();
        let close_notified = Arc::clone(&self.close_notified);

        let task_handle = match self.reader.take() {
            Some(reader) => tokio::spawn(async move {
                reader_loop(reader, handler, session_id, shutdown_rx, close_notified).await;
            }),
            None => tokio::spawn(async move {
                let reader = BufReader::new(tokio::io::stdin());
                reader_loop(reader, handler, session_id, shutdown_rx, close_notified).await;
            }),
        };
        self.task_handle = Some(task_handle);
        self.is_running = true;
        Ok(())
    }

    async fn send_with_options(
        &mut self,
        message: JsonRpcMessage,
        _options: SendOptions,
    ) -> Result<(), Self::Error> {
        let json = message.to_json()?;

        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        } else {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(json.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        if !self.is_running {
            return Ok(());
        }

        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(());
        }
        if let Some(task_handle) = self.task_handle.take() {
            let _ = task_handle.await;
        }

        // Release the streams so no listener outlives the transport.
        self.reader = None;
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }

        self.is_running = false;
        self.shutdown_tx = None;
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        Some(self.session_id.clone())
    }

    fn is_connected(&self) -> bool {
        self.is_running
    }

    fn transport_type(&self) -> &'static str {
        "stdio"
    }
}

/// Builder for stdio transports
///
/// Transports come out of the builder with their handler pre-configured,
/// so a built transport is always startable.
pub struct StdioTransportBuilder<R = DefaultStdin, W = DefaultStdout>
where
    R: AsyncBufReadExt + Unpin + Send + Sync + 'static,
    W: AsyncWriteExt + Unpin + Send + Sync + 'static,
{
    message_handler: Option<Arc<dyn MessageHandler>>,
    custom_reader: Option<R>,
    custom_writer: Option<W>,
    session_id: Option<String>,
}

impl StdioTransportBuilder<DefaultStdin, DefaultStdout> {
    /// Builder for a production transport over stdin/stdout
    pub fn new() -> Self {
        Self {
            message_handler: None,
            custom_reader: None,
            custom_writer: None,
            session_id: None,
        }
    }

    /// Substitute custom I/O streams (dependency injection for tests)
    pub fn with_custom_io<NewR, NewW>(
        self,
        reader: NewR,
        writer: NewW,
    ) -> StdioTransportBuilder<NewR, NewW>
    where
        NewR: AsyncBufReadExt + Unpin + Send + Sync + 'static,
        NewW: AsyncWriteExt + Unpin + Send + Sync + 'static,
    {
        StdioTransportBuilder {
            message_handler: self.message_handler,
            custom_reader: Some(reader),
            custom_writer: Some(writer),
            session_id: self.session_id,
        }
    }
}

impl Default for StdioTransportBuilder<DefaultStdin, DefaultStdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, W> StdioTransportBuilder<R, W>
where
    R: AsyncBufReadExt + Unpin + Send + Sync + 'static,
    W: AsyncWriteExt + Unpin + Send + Sync + 'static,
{
    /// Set the message handler (required)
    pub fn with_message_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.message_handler = Some(handler);
        self
    }

    /// Override the default `"stdio"` session id
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Build the configured transport
    pub async fn build(self) -> Result<StdioTransport<R, W>, TransportError> {
        let handler = self
            .message_handler
            .ok_or_else(|| TransportError::connection("message handler must be set"))?;

        Ok(StdioTransport {
            message_handler: Some(handler),
            shutdown_tx: None,
            task_handle: None,
            session_id: self.session_id.unwrap_or_else(|| "stdio".to_string()),
            is_running: false,
            close_notified: Arc::new(AtomicBool::new(false)),
            reader: self.custom_reader,
            writer: self.custom_writer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestId;
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::time::Duration;

    /// Writer that captures everything written for inspection
    #[derive(Clone)]
    struct MockWriter {
        data: Arc<Mutex<Vec<u8>>>,
        should_fail: Arc<AtomicBool>,
    }

    impl MockWriter {
        fn new() -> Self {
            Self {
                data: Arc::new(Mutex::new(Vec::new())),
                should_fail: Arc::new(AtomicBool::new(false)),
            }
        }

        fn messages(&self) -> Vec<String> {
            let data = self.data.lock().unwrap().clone();
            String::from_utf8_lossy(&data)
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|s| s.to_string())
                .collect()
        }
    }

    impl tokio::io::AsyncWrite for MockWriter {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<Result<usize, std::io::Error>> {
            if self.should_fail.load(Ordering::Acquire) {
                return std::task::Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "mock write failure",
                )));
            }
            self.data.lock().unwrap().extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), std::io::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), std::io::Error>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    struct MockHandler {
        messages: Arc<Mutex<Vec<JsonRpcMessage>>>,
        errors: Arc<Mutex<Vec<String>>>,
        close_count: Arc<AtomicUsize>,
    }

    impl MockHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: Arc::new(Mutex::new(Vec::new())),
                errors: Arc::new(Mutex::new(Vec::new())),
                close_count: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn messages(&self) -> Vec<JsonRpcMessage> {
            self.messages.lock().unwrap().clone()
        }

        fn errors(&self) -> Vec<String> {
            self.errors.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageHandler for MockHandler {
        async fn handle_message(&self, message: JsonRpcMessage, _context: MessageContext) {
            self.messages.lock().unwrap().push(message);
        }

        async fn handle_error(&self, error: TransportError) {
            self.errors.lock().unwrap().push(error.to_string());
        }

        async fn handle_close(&self) {
            self.close_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn reader_for(lines: &[&str]) -> BufReader<Cursor<Vec<u8>>> {
        let mut data = Vec::new();
        for line in lines {
            data.extend_from_slice(line.as_bytes());
            data.push(b'\n');
        }
        BufReader::new(Cursor::new(data))
    }

    #[tokio::test]
    async fn builder_requires_a_handler() {
        let result = StdioTransportBuilder::new().build().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn reads_frames_in_order_and_closes_on_eof() {
        let handler = MockHandler::new();
        let lines = [
            r#"{"jsonrpc":"2.0","method":"initialize","params":{"capabilities":{}},"id":1}"#,
            r#"{"jsonrpc":"2.0","method":"ping","id":2}"#,
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        ];
        let mut transport = StdioTransportBuilder::new()
            .with_custom_io(reader_for(&lines), MockWriter::new())
            .with_message_handler(handler.clone())
            .build()
            .await
            .unwrap();

        transport.start().await.unwrap();
        transport.wait_for_completion().await.unwrap();

        let messages = handler.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].method(), Some("initialize"));
        assert_eq!(messages[1].method(), Some("ping"));
        assert_eq!(messages[2].method(), Some("notifications/initialized"));
        assert_eq!(handler.close_count.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn parse_errors_do_not_abort_the_stream() {
        let handler = MockHandler::new();
        let lines = [
            r#"{"jsonrpc":"2.0","method":"first"}"#,
            r#"{"broken json"#,
            r#"{"jsonrpc":"2.0","method":"second"}"#,
        ];
        let mut transport = StdioTransportBuilder::new()
            .with_custom_io(reader_for(&lines), MockWriter::new())
            .with_message_handler(handler.clone())
            .build()
            .await
            .unwrap();

        transport.start().await.unwrap();
        transport.wait_for_completion().await.unwrap();

        let messages = handler.messages();
        assert_eq!(messages.len(), 2, "good frames around the bad one survive");
        assert_eq!(messages[1].method(), Some("second"));
        assert_eq!(handler.errors().len(), 1);
    }

    #[tokio::test]
    async fn send_writes_one_line_per_message() {
        let handler = MockHandler::new();
        let writer = MockWriter::new();
        let mut transport = StdioTransportBuilder::new()
            .with_custom_io(reader_for(&[]), writer.clone())
            .with_message_handler(handler)
            .build()
            .await
            .unwrap();
        transport.start().await.unwrap();

        transport
            .send(JsonRpcMessage::response(
                serde_json::json!({"pong": true}),
                RequestId::new_number(42),
            ))
            .await
            .unwrap();
        transport
            .send(JsonRpcMessage::notification("notifications/message", None))
            .await
            .unwrap();

        let written = writer.messages();
        assert_eq!(written.len(), 2);
        let first: serde_json::Value = serde_json::from_str(&written[0]).unwrap();
        assert_eq!(first["id"], 42);

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn write_failure_surfaces_as_io_error() {
        let handler = MockHandler::new();
        let writer = MockWriter::new();
        writer.should_fail.store(true, Ordering::Release);
        let mut transport = StdioTransportBuilder::new()
            .with_custom_io(reader_for(&[]), writer)
            .with_message_handler(handler)
            .build()
            .await
            .unwrap();
        transport.start().await.unwrap();

        let result = transport
            .send(JsonRpcMessage::notification("x", None))
            .await;
        assert!(matches!(result, Err(TransportError::Io { .. })));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_fires_handle_close_exactly_once() {
        let handler = MockHandler::new();
        // A reader that never yields data keeps the loop parked on read.
        let (_keep_alive, rx) = tokio::io::duplex(64);
        let mut transport = StdioTransportBuilder::new()
            .with_custom_io(BufReader::new(rx), MockWriter::new())
            .with_message_handler(handler.clone())
            .build()
            .await
            .unwrap();

        transport.start().await.unwrap();
        assert!(transport.is_connected());

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handler.close_count.load(Ordering::Acquire), 1);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let handler = MockHandler::new();
        let mut transport = StdioTransportBuilder::new()
            .with_custom_io(reader_for(&[]), MockWriter::new())
            .with_message_handler(handler)
            .build()
            .await
            .unwrap();
        transport.start().await.unwrap();
        assert!(transport.start().await.is_err());
        transport.close().await.unwrap();
    }
}
