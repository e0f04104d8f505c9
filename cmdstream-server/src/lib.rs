//! cmdstream Server
//!
//! Connection-dispatch engine for command-streaming servers. A connection
//! receiver accepts TCP or TLS connections into a bounded dispatch queue and
//! a pool of workers hands each of them to a [`Delegate`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cmdstream_server::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::builder()
//!         .workers(16)
//!         .build(from_fn(|mut conn: BoxedConnection| async move {
//!             conn.write_all(b"hello\n").await?;
//!             Ok(())
//!         }))
//!         .unwrap();
//!
//!     let err = server.listen_and_serve("0.0.0.0:9000").await.unwrap_err();
//!     eprintln!("{}", err);
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
#![doc(html_root_url = "https://docs.rs/cmdstream-server/")]

// Public modules
pub mod config;
pub mod error;
pub mod handler;
pub mod logging;
pub mod queue;
pub mod receiver;
pub mod server;
pub mod task_group;
pub mod worker;

// Prelude module with common imports
pub mod prelude;

// Re-export key types for convenience
pub use config::{ServerConfig, TlsConfig};
pub use error::{BoxError, ServerError, ERROR_PREFIX};
pub use handler::{from_fn, BoxedDelegate, Delegate, FnDelegate, LostConnCallback};
pub use queue::{dispatch_queue, ConnQueue, ConnSender};
pub use receiver::ConnReceiver;
pub use server::{Server, ServerBuilder, ServerState, Termination};
pub use task_group::{BoxedTask, Task, TaskGroup, TaskGroupError};
pub use worker::{DefaultWorkerFactory, Worker, WorkerFactory};
