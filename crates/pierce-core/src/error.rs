//! Error types for the negotiation core.

use thiserror::Error;

/// Errors that can occur while negotiating a session or punching holes.
#[derive(Debug, Error)]
pub enum PunchError {
    /// Transport-level failure (connect, DNS, send/recv, bind)
    #[error("Network error: {0}")]
    Network(String),

    /// The server answered with a non-success HTTP status
    #[error("HTTP request failed with status {0}")]
    HttpStatus(u16),

    /// A bounded wait expired
    #[error("Operation timed out")]
    Timeout,

    /// A state precondition was violated
    #[error("Session not ready: {0}")]
    Uninitialized(&'static str),

    /// A JSON document did not match the expected schema
    #[error("Unexpected JSON schema: {0}")]
    InvalidSchema(String),

    /// A protocol invariant was broken by the peer or the server
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Reachability probing failed
    #[error(transparent)]
    Net(#[from] pierce_net::NetError),
}

impl From<std::io::Error> for PunchError {
    fn from(e: std::io::Error) -> Self {
        Self::Network(e.to_string())
    }
}

impl From<reqwest::Error> for PunchError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// Result type for negotiation operations.
pub type PunchResult<T> = Result<T, PunchError>;
