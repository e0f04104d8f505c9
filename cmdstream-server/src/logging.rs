//! Logging utilities for the server
//!
//! Components emit `tracing` events directly. This module holds the
//! subscriber setup and the lifecycle events shared by `serve` and its
//! callers.

use crate::error::ServerError;
use std::net::SocketAddr;

/// Initialize logging subsystem
///
/// Reads the filter from `RUST_LOG`, defaulting to `info`.
#[cfg(feature = "logging")]
pub fn init_logging() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Initialize logging subsystem (no-op when logging feature is disabled)
#[cfg(not(feature = "logging"))]
pub fn init_logging() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    Ok(())
}

/// Record the start of a `serve` call
pub fn serving_started(local_addr: Option<SocketAddr>, workers: usize) {
    match local_addr {
        Some(addr) => tracing::info!(%addr, workers, "server started serving"),
        None => tracing::info!(workers, "server started serving"),
    }
}

/// Record the end of a `serve` call
///
/// Requested stops are logged at info level, anything else is an error.
/// `task` is the index of the task whose failure ended serving.
pub fn serving_ended(err: &ServerError, task: Option<usize>) {
    if err.is_requested() {
        tracing::info!(reason = %err, "server stopped serving");
        return;
    }

    match task {
        Some(task) => tracing::error!(task, error = %err, "server failed"),
        None => tracing::error!(error = %err, "server failed"),
    }
}
