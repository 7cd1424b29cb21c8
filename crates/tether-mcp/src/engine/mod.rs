//! Engine Layer
//!
//! Request/response correlation, handler dispatch, progress routing,
//! cancellation, timeouts, and the initialization handshake — everything
//! between the application and a [`crate::protocol::Transport`].

pub mod engine;
pub mod error;
pub mod handshake;
pub(crate) mod pending;

pub use engine::{
    EngineBuilder, EngineOptions, NotificationHandler, ProtocolEngine, RequestContext,
    RequestHandler, RequestOptions,
};
pub use error::EngineError;
pub use handshake::{negotiate_protocol_version, ServerIdentity};
pub use pending::ProgressCallback;
