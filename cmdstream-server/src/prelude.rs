//! Prelude module with common imports
//!
//! This module re-exports the most commonly used types and traits
//! from the cmdstream-server crate for ergonomic imports.

// Server types
pub use crate::config::{ServerConfig, TlsConfig};
pub use crate::error::ServerError;
pub use crate::handler::{from_fn, Delegate, LostConnCallback};
pub use crate::server::{Server, ServerBuilder, ServerState, Termination};
pub use crate::worker::{DefaultWorkerFactory, WorkerFactory};

// Re-export core types
pub use cmdstream_core::prelude::*;
