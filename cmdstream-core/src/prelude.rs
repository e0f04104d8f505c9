//! Prelude module for cmdstream Core
//!
//! This module re-exports commonly used types and traits to make them
//! easily accessible for users of the library.

pub use crate::error::{Error, Result};
pub use crate::transport::{BoxedConnection, Connection, Listener};

// Re-export commonly used external dependencies
pub use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
