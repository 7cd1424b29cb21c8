//! Auth Provider Interface
//!
//! The streamable HTTP client treats OAuth as an external collaborator:
//! this trait is the whole surface the transport calls into. Tokens are
//! read before each request; an HTTP 401 triggers `authorize`, which
//! either completes inline or hands the user a redirect, after which the
//! application calls back through
//! [`super::StreamableHttpClientTransport::finish_auth`].

// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use thiserror::Error;

// Layer 3: Internal module imports
// (none)

/// Result of driving the auth flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Tokens are available; the failed request may be retried
    Authorized,
    /// The user must visit this URL; the flow resumes via `finish_auth`
    Redirect(String),
}

/// Auth provider failure
#[derive(Error, Debug)]
pub enum AuthError {
    /// The flow itself failed (network, denied grant, bad code, ...)
    #[error("Authorization flow failed: {message}")]
    Flow { message: String },

    /// The provider has no way to authorize this request
    #[error("Authorization not available: {message}")]
    Unavailable { message: String },
}

impl AuthError {
    /// Convenience constructor for flow failures
    pub fn flow(message: impl Into<String>) -> Self {
        AuthError::Flow {
            message: message.into(),
        }
    }
}

/// OAuth collaborator interface for the streamable HTTP client
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// The current access token, if one is available
    async fn access_token(&self) -> Option<String>;

    /// Run the auth flow after a 401; token refresh and user redirects are
    /// the provider's business
    async fn authorize(&self) -> Result<AuthOutcome, AuthError>;

    /// Complete an interrupted redirect flow with the authorization code
    async fn finish_authorization(&self, code: &str) -> Result<AuthOutcome, AuthError>;
}
