//! Error types for cmdstream
//!
//! This module defines the errors shared by listeners, connections and
//! connection delegates. Server-level errors live in `cmdstream-server`.

use thiserror::Error;

/// Result type alias for cmdstream operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by listeners, connections and delegates
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The accept deadline passed before a connection arrived
    #[error("accept deadline exceeded")]
    Timeout,

    /// The listener was closed
    #[error("listener closed")]
    ListenerClosed,

    /// TLS handshake with a single peer failed
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic errors
    #[error("Error: {0}")]
    Other(String),
}

impl Error {
    /// Check whether the error is an accept deadline expiry
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Check whether the error concerns a single connection attempt
    /// rather than the listener as a whole.
    ///
    /// Transient errors do not end an accept loop.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Handshake(_))
    }
}
