//! Stdio Client Transport Implementation
//!
//! Client side of a stdio MCP connection: spawns the server as a child
//! process and exchanges newline-delimited JSON-RPC frames over the
//! child's stdin/stdout. Spawn configuration (command, arguments,
//! environment, working directory) lives in [`StdioClientConfig`]; the
//! framing and delivery semantics are identical to the server side.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::broadcast;
use tracing::{debug, warn};

// Layer 3: Internal module imports
use super::transport::{notify_close_once, reader_loop};
use crate::protocol::{
    JsonRpcMessage, MessageHandler, SendOptions, Transport, TransportError, WireFormat,
};

/// Spawn configuration for a stdio MCP server child process
#[derive(Debug, Clone)]
pub struct StdioClientConfig {
    /// Command to execute
    pub command: String,
    /// Arguments passed to the command
    pub args: Vec<String>,
    /// Environment variables set for the child
    pub env_vars: HashMap<String, String>,
    /// Working directory for the child
    pub working_dir: Option<PathBuf>,
}

impl StdioClientConfig {
    /// Configuration for `command` with no arguments
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env_vars: HashMap::new(),
            working_dir: None,
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Replace the argument list
    pub fn args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args = args.into_iter().collect();
        self
    }

    /// Set one environment variable for the child
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    /// Set the child's working directory
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Stdio transport that owns a child process
///
/// `start()` spawns the configured command with piped stdio and begins
/// reading frames from the child's stdout; `send` writes frames to the
/// child's stdin; `close()` kills and reaps the child so neither streams
/// nor the process leak.
///
/// # Examples
///
/// ```rust,no_run
/// use tether_mcp::transport::stdio::{StdioClientConfig, StdioClientTransport};
///
/// let config = StdioClientConfig::new("python")
///     .arg("-m")
///     .arg("my_mcp_server")
///     .env("LOG_LEVEL", "debug");
/// let transport = StdioClientTransport::new(config);
/// ```
pub struct StdioClientTransport {
    config: StdioClientConfig,
    message_handler: Option<Arc<dyn MessageHandler>>,
    child: Option<Child>,
    stdin: Option<BufWriter<ChildStdin>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
    close_notified: Arc<AtomicBool>,
    is_running: bool,
}

impl StdioClientTransport {
    /// Create a transport for the given spawn configuration
    pub fn new(config: StdioClientConfig) -> Self {
        Self {
            config,
            message_handler: None,
            child: None,
            stdin: None,
            shutdown_tx: None,
            task_handle: None,
            close_notified: Arc::new(AtomicBool::new(false)),
            is_running: false,
        }
    }

    /// The spawn configuration
    pub fn config(&self) -> &StdioClientConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for StdioClientTransport {
    type Error = TransportError;

    fn set_message_handler(&mut self, handler: Arc<dyn MessageHandler>) {
        self.message_handler = Some(handler);
    }

    async fn start(&mut self) -> Result<(), Self::Error> {
        if self.is_running {
            return Err(TransportError::connection("transport already started"));
        }
        if self.config.command.is_empty() {
            return Err(TransportError::connection("no command configured"));
        }
        let handler = self
            .message_handler
            .as_ref()
            .ok_or_else(|| TransportError::connection("no message handler configured"))?
            .clone();

        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (key, value) in &self.config.env_vars {
            command.env(key, value);
        }
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        debug!(command = %self.config.command, "spawned stdio server child");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::connection("child stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::connection("child stdout not captured"))?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);
        let close_notified = Arc::clone(&self.close_notified);

        self.task_handle = Some(tokio::spawn(async move {
            reader_loop(
                BufReader::new(stdout),
                handler,
                "stdio".to_string(),
                shutdown_rx,
                close_notified,
            )
            .await;
        }));

        self.stdin = Some(BufWriter::new(stdin));
        self.child = Some(child);
        self.is_running = true;
        Ok(())
    }

    async fn send_with_options(
        &mut self,
        message: JsonRpcMessage,
        _options: SendOptions,
    ) -> Result<(), Self::Error> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| TransportError::connection("transport not started"))?;

        let json = message.to_json()?;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        if !self.is_running {
            return Ok(());
        }

        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(());
        }

        // Closing stdin first gives a well-behaved server its EOF.
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }

        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                warn!("failed to kill stdio server child: {e}");
            }
            let _ = child.wait().await;
        }

        if let Some(task_handle) = self.task_handle.take() {
            let _ = task_handle.await;
        }

        if let Some(handler) = &self.message_handler {
            notify_close_once(handler, &self.close_notified).await;
        }

        self.is_running = false;
        self.shutdown_tx = None;
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        None
    }

    fn is_connected(&self) -> bool {
        self.is_running
    }

    fn transport_type(&self) -> &'static str {
        "stdio-client"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageContext;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct MockHandler {
        messages: Arc<Mutex<Vec<JsonRpcMessage>>>,
        close_count: Arc<AtomicUsize>,
    }

    impl MockHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: Arc::new(Mutex::new(Vec::new())),
                close_count: Arc::new(AtomicUsize::new(0)),
            })
        }
    }

    #[async_trait]
    impl MessageHandler for MockHandler {
        async fn handle_message(&self, message: JsonRpcMessage, _context: MessageContext) {
            self.messages.lock().unwrap().push(message);
        }

        async fn handle_error(&self, _error: TransportError) {}

        async fn handle_close(&self) {
            self.close_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    #[test]
    fn config_builder_accumulates_settings() {
        let config = StdioClientConfig::new("server")
            .arg("--stdio")
            .env("A", "1")
            .working_dir("/tmp");
        assert_eq!(config.command, "server");
        assert_eq!(config.args, vec!["--stdio".to_string()]);
        assert_eq!(config.env_vars.get("A").map(String::as_str), Some("1"));
        assert_eq!(config.working_dir, Some(PathBuf::from("/tmp")));
    }

    #[tokio::test]
    async fn start_without_handler_fails() {
        let mut transport = StdioClientTransport::new(StdioClientConfig::new("true"));
        assert!(transport.start().await.is_err());
    }

    #[tokio::test]
    async fn start_with_empty_command_fails() {
        let mut transport = StdioClientTransport::new(StdioClientConfig::new(""));
        transport.set_message_handler(MockHandler::new());
        assert!(transport.start().await.is_err());
    }

    #[tokio::test]
    async fn send_before_start_fails() {
        let mut transport = StdioClientTransport::new(StdioClientConfig::new("true"));
        let result = transport
            .send(JsonRpcMessage::notification("x", None))
            .await;
        assert!(matches!(result, Err(TransportError::Connection { .. })));
    }

    #[tokio::test]
    async fn echo_child_round_trip() {
        // `cat` echoes our frames back verbatim, which is enough to prove
        // the child wiring: stdin write -> child -> stdout read -> handler.
        let handler = MockHandler::new();
        let mut transport = StdioClientTransport::new(StdioClientConfig::new("cat"));
        transport.set_message_handler(handler.clone());
        transport.start().await.unwrap();
        assert!(transport.is_connected());

        let request =
            JsonRpcMessage::request("ping", None, crate::protocol::RequestId::new_number(1));
        transport.send(request.clone()).await.unwrap();

        // Give the child a moment to echo.
        for _ in 0..50 {
            if !handler.messages.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let received = handler.messages.lock().unwrap().clone();
        assert_eq!(received, vec![request]);

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
        assert_eq!(handler.close_count.load(Ordering::Acquire), 1);
    }
}
