//! # cmdstream Core
//!
//! Core abstractions shared by the cmdstream transports and server:
//!
//! - Error handling and types
//! - The [`Connection`] and [`Listener`] traits
//! - Absolute accept deadlines usable by any listener implementation

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
#![doc(html_root_url = "https://docs.rs/cmdstream-core/")]

// Core modules
pub mod error;
pub mod transport;

// Prelude module with common imports
pub mod prelude;

// Re-export key types for convenience
pub use error::{Error, Result};
pub use transport::{
    AcceptDeadline, BoxedConnection, Connection, Listener, DEFAULT_HANDSHAKE_TIMEOUT,
};
