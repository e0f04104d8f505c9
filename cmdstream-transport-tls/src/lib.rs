//! TLS Transport for cmdstream
//!
//! This crate decorates the TCP listener from `cmdstream-transport-tcp` with
//! a rustls acceptor. Accept deadlines and close are forwarded to the TCP
//! listener, so the server's timed accept loop works unchanged over TLS.
//! The handshake runs on the connection's first read or write.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
#![doc(html_root_url = "https://docs.rs/cmdstream-transport-tls/")]

pub mod tls;

// Re-export TLS transport types
pub use tls::{TlsConnection, TlsListener, DEFAULT_HANDSHAKE_TIMEOUT};

/// Prelude module
pub mod prelude {
    pub use crate::tls::{TlsConnection, TlsListener};
    pub use cmdstream_core::transport::{Connection, Listener};
}
