//! Error types for the Sluice gateway.

use thiserror::Error;

/// Main error type for Sluice operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rate expression such as `10/1s` could not be parsed
    #[error("Invalid rate '{0}'")]
    InvalidRate(String),

    /// No limiter is registered under the requested strategy name
    #[error("No such strategy: {0}")]
    UnknownStrategy(String),

    /// A rate limit is keyed by something that is not an HTTP method
    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    /// The destination of a resource is not a usable upstream URL
    #[error("Invalid upstream URL '{url}': {reason}")]
    InvalidUpstream { url: String, reason: String },

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Sluice operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
