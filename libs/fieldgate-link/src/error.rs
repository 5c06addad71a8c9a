//! Link Error Types
//!
//! One error enum shared by the link layer and every protocol codec. Each
//! variant maps to a failure kind the polling layer can count.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for fieldgate operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Failure kind without the detail text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Argument,
    Protocol,
    Timeout,
    Cancelled,
    Transport,
    Disposed,
    Config,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Argument => "ARGUMENT",
            ErrorKind::Protocol => "PROTOCOL",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Transport => "TRANSPORT",
            ErrorKind::Disposed => "DISPOSED",
            ErrorKind::Config => "CONFIG",
        };
        f.write_str(name)
    }
}

/// Link and protocol errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Malformed address text or out-of-range bit/byte index
    #[error("Argument error: {0}")]
    Argument(String),

    /// Checksum mismatch, unexpected function code, malformed frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No slot or no matching frame within the channel timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Caller-initiated cancellation
    #[error("Operation cancelled")]
    Cancelled,

    /// Connect or send failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation on a closed channel or device
    #[error("Channel disposed")]
    Disposed,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Transport(err.to_string())
    }
}

impl From<figment::Error> for LinkError {
    fn from(err: figment::Error) -> Self {
        LinkError::Config(err.to_string())
    }
}

// Helper methods for creating errors
impl LinkError {
    pub fn argument(msg: impl Into<String>) -> Self {
        LinkError::Argument(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        LinkError::Protocol(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        LinkError::Timeout(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        LinkError::Transport(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        LinkError::Config(msg.into())
    }

    /// Taxonomy tag of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            LinkError::Argument(_) => ErrorKind::Argument,
            LinkError::Protocol(_) => ErrorKind::Protocol,
            LinkError::Timeout(_) => ErrorKind::Timeout,
            LinkError::Cancelled => ErrorKind::Cancelled,
            LinkError::Transport(_) => ErrorKind::Transport,
            LinkError::Disposed => ErrorKind::Disposed,
            LinkError::Config(_) => ErrorKind::Config,
        }
    }

    /// Check if this error indicates a need for reconnection
    pub fn needs_reconnect(&self) -> bool {
        matches!(self, LinkError::Transport(_))
    }
}
