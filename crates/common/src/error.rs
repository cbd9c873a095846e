//! Error types for FunnelDeck

use thiserror::Error;

/// Result type alias using FunnelDeck Error
pub type Result<T> = std::result::Result<T, Error>;

/// FunnelDeck error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Bad request shape or a port outside the funnel allow-list.
    /// Recovered locally and surfaced as HTTP 400.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A subprocess failed or could not be spawned. Surfaced as HTTP 500
    /// with a generic message; the detail stays in server logs.
    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    /// Unexpected external-tool output shape. Parsers recover by returning
    /// empty or partial structures; this never crosses a request boundary.
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
