//! # cmdstream
//!
//! Connection-dispatch engine for command-streaming servers.
//!
//! A server accepts TCP or TLS connections into a bounded queue whose
//! capacity equals the worker count, so accepting slows down as soon as
//! every worker is busy. Each connection is handed to exactly one worker,
//! which runs the application's [`Delegate`](server::Delegate) on it.
//! Serving ends through a graceful shutdown (queued connections are still
//! handled), a forced close (queued connections are dropped) or a listener
//! failure.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cmdstream::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::builder()
//!         .workers(8)
//!         .build(from_fn(|mut conn: BoxedConnection| async move {
//!             let mut command = [0u8; 1];
//!             conn.read_exact(&mut command).await?;
//!             conn.write_all(&command).await?;
//!             Ok(())
//!         }))
//!         .unwrap();
//!
//!     if let Err(err) = server.listen_and_serve("0.0.0.0:9000").await {
//!         eprintln!("{}", err);
//!     }
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
#![doc(html_root_url = "https://docs.rs/cmdstream/")]

// Re-export core components
pub use cmdstream_core::*;

#[cfg(feature = "transport-tcp")]
pub use cmdstream_transport_tcp as transport_tcp;

#[cfg(feature = "transport-tls")]
pub use cmdstream_transport_tls as transport_tls;

#[cfg(feature = "server")]
pub use cmdstream_server as server;

/// Prelude module with common imports
pub mod prelude {
    pub use cmdstream_core::prelude::*;

    #[cfg(feature = "server")]
    pub use cmdstream_server::prelude::*;

    #[cfg(feature = "transport-tcp")]
    pub use cmdstream_transport_tcp::prelude::*;

    #[cfg(feature = "transport-tls")]
    pub use cmdstream_transport_tls::prelude::*;
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_library_compiles() {
        assert_eq!(env!("CARGO_PKG_NAME"), "cmdstream");
    }
}
