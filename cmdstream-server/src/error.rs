//! Server error types
//!
//! Every [`ServerError`] message starts with [`ERROR_PREFIX`], so errors that
//! leave the server are recognisable in logs and wrapped error chains.

use cmdstream_core::Error;
use tokio::task::JoinError;

/// Prefix carried by every server error message
pub const ERROR_PREFIX: &str = "cmdstream server: ";

/// Boxed error type for custom task failures
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Server-specific errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The configured worker count is zero
    #[error("cmdstream server: not positive worker count")]
    NoWorkers,

    /// Shutdown or close was requested while the server was not serving
    #[error("cmdstream server: server is not serving")]
    NotServing,

    /// Serve was called while the server was already serving
    #[error("cmdstream server: server is already serving")]
    AlreadyServing,

    /// Serving ended because shutdown was requested
    #[error("cmdstream server: shutdown")]
    Shutdown,

    /// Serving ended because close was requested
    #[error("cmdstream server: closed")]
    Closed,

    /// The connection receiver is no longer running
    #[error("cmdstream server: connection receiver is not running")]
    ReceiverStopped,

    /// The listener failed with a non-timeout error
    #[error("cmdstream server: accept failed: {0}")]
    Accept(#[source] Error),

    /// Binding a listener or building its TLS layer failed
    #[error("cmdstream server: transport error: {0}")]
    Transport(#[from] Error),

    /// Invalid configuration
    #[error("cmdstream server: invalid configuration: {0}")]
    Config(String),

    /// A custom worker task failed
    #[error("cmdstream server: worker {index} failed: {source}")]
    Worker {
        /// Task index of the worker
        index: usize,
        /// Underlying failure
        #[source]
        source: BoxError,
    },

    /// A task panicked or was aborted
    #[error("cmdstream server: task panicked: {0}")]
    TaskPanicked(#[from] JoinError),

    /// Every task finished cleanly although nobody asked the server to stop
    #[error("cmdstream server: serving ended without a shutdown or close request")]
    UnexpectedTermination,
}

impl ServerError {
    /// Check whether the error reports a requested stop ([`Shutdown`] or
    /// [`Closed`]) rather than a failure
    ///
    /// [`Shutdown`]: ServerError::Shutdown
    /// [`Closed`]: ServerError::Closed
    pub fn is_requested(&self) -> bool {
        matches!(self, ServerError::Shutdown | ServerError::Closed)
    }
}
