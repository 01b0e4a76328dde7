//! Error types for the DAP bridge
//!
//! Protocol-level failures (bad frames, absent or failing backends, timeouts)
//! are handled inside the session and never surface here. These variants
//! cover the I/O edges: configuration, process spawning, sockets.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the bridge
#[derive(Error, Debug)]
pub enum Error {
    // === Backend Errors ===
    #[error("Debug backend '{name}' not found. Searched: {searched}")]
    BackendNotFound { name: String, searched: String },

    #[error("Debug backend failed to start: {0}")]
    BackendStartFailed(String),

    // === Client Connection Errors ===
    #[error("Failed to listen on {addr}: {error}")]
    Bind { addr: String, error: String },

    // === DAP Protocol Errors ===
    #[error("DAP protocol error: {0}")]
    DapProtocol(String),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a backend not found error with search paths
    pub fn backend_not_found<S: AsRef<str>>(name: &str, paths: &[S]) -> Self {
        Self::BackendNotFound {
            name: name.to_string(),
            searched: paths.iter().map(|s| s.as_ref()).collect::<Vec<_>>().join(", "),
        }
    }

    /// Whether this error means the peer went away rather than misbehaved
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}
