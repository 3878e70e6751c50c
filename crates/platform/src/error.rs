//! Error types for Skiff

use std::fmt;

/// Unified error type for all Skiff operations
#[derive(Debug)]
pub enum SkiffError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error (malformed frame, unexpected message, bad state)
    Protocol(String),

    /// Security error (MAC mismatch, signature failure, rejected host key)
    Security(String),

    /// Algorithm negotiation error (no common algorithm, guess mismatch)
    Negotiation(String),

    /// Authentication rejected by the peer
    Authentication(String),

    /// The peer did not respond within the allowed time
    Timeout(String),

    /// The connection was closed while an operation was waiting on it
    Closed,

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for SkiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkiffError::Io(e) => write!(f, "IO error: {}", e),
            SkiffError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SkiffError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SkiffError::Security(msg) => write!(f, "Security error: {}", msg),
            SkiffError::Negotiation(msg) => write!(f, "Negotiation error: {}", msg),
            SkiffError::Authentication(msg) => write!(f, "Authentication failed: {}", msg),
            SkiffError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            SkiffError::Closed => write!(f, "Connection closed"),
            SkiffError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for SkiffError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SkiffError::Io(e) => Some(e),
            SkiffError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SkiffError {
    fn from(err: std::io::Error) -> Self {
        SkiffError::Io(err)
    }
}

/// Result type for Skiff operations
pub type SkiffResult<T> = Result<T, SkiffError>;
