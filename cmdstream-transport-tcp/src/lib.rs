//! TCP Transport for cmdstream
//!
//! This crate provides the plain TCP [`Listener`](cmdstream_core::Listener)
//! implementation, with absolute accept deadlines.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
#![doc(html_root_url = "https://docs.rs/cmdstream-transport-tcp/")]

pub mod tcp;

// Re-export TCP transport types
pub use tcp::{TcpConnection, TcpListener};

/// Prelude module
pub mod prelude {
    pub use crate::tcp::{TcpConnection, TcpListener};
    pub use cmdstream_core::transport::{Connection, Listener};
}
