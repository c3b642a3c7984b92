//! Error types for the monitor

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the monitor
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    #[error("Invalid seed: {0}")]
    InvalidSeed(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // Transport errors
    #[error("WebSocket connection failed: {0}")]
    Connection(String),

    #[error("WebSocket closed: {0}")]
    ConnectionClosed(String),

    #[error("Connection appears dead (no pong received)")]
    DeadConnection,

    #[error("Request timed out after {0}ms")]
    RequestTimeout(u64),

    #[error("Maximum reconnection attempts ({0}) reached")]
    ReconnectExhausted(u32),

    // Throttling
    #[error("Rate limited by server")]
    RateLimited,

    // Ledger request/response errors
    #[error("Ledger request failed: {0}")]
    Rpc(String),

    // Parse / validation errors
    #[error("Malformed frame: {0}")]
    Parse(String),

    // Persistence errors
    #[error("Store operation failed: {0}")]
    Store(String),

    // Follower submission errors
    #[error("Transaction signing failed: {0}")]
    Signing(String),

    #[error("Transaction rejected: {0}")]
    Submission(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Connection(_)
                | Error::ConnectionClosed(_)
                | Error::DeadConnection
                | Error::RequestTimeout(_)
                | Error::RateLimited
                | Error::Rpc(_)
        )
    }

    /// Only configuration problems and exhausted reconnects take the process down
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::MissingConfig(_)
                | Error::InvalidSeed(_)
                | Error::ReconnectExhausted(_)
        )
    }
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Error::ConnectionClosed(e.to_string())
            }
            other => Error::Connection(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
