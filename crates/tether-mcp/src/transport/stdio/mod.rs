//! Stdio Transport
//!
//! Newline-delimited JSON-RPC over standard streams. Two shapes:
//!
//! - [`StdioTransport`]: the server side, reading frames from this
//!   process's stdin and writing frames to its stdout (generic over the
//!   streams so tests can inject their own)
//! - [`StdioClientTransport`]: the client side, spawning the server as a
//!   child process and talking over the child's stdin/stdout

pub mod client;
pub mod transport;

pub use client::{StdioClientConfig, StdioClientTransport};
pub use transport::{DefaultStdin, DefaultStdout, StdioTransport, StdioTransportBuilder};
