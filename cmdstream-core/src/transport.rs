//! Transport layer abstraction
//!
//! This module provides the listener and connection abstractions the server
//! accepts from. Listeners support an absolute accept deadline regardless of
//! the underlying transport (plain TCP or TLS), so an accept loop can always
//! poll with timed accepts.

use crate::error::{Error, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};

/// Default bound on a server-side TLS handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A bidirectional stream accepted by a [`Listener`]
pub trait Connection:
    AsyncRead + AsyncWrite + std::fmt::Debug + Send + Sync + Unpin + 'static
{
    /// Get the remote address, captured when the connection was accepted
    fn peer_addr(&self) -> SocketAddr;

    /// Get the local address
    fn local_addr(&self) -> SocketAddr;
}

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn peer_addr(&self) -> SocketAddr {
        (**self).peer_addr()
    }

    fn local_addr(&self) -> SocketAddr {
        (**self).local_addr()
    }
}

/// Boxed connection type handed from listeners to delegates
pub type BoxedConnection = Box<dyn Connection>;

/// Listener trait for abstracting different transport types
#[async_trait::async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Accept an incoming connection
    ///
    /// Fails with [`Error::Timeout`] once the deadline set by
    /// [`set_deadline`](Listener::set_deadline) passes, and with
    /// [`Error::ListenerClosed`] after [`close`](Listener::close).
    async fn accept(&self) -> Result<BoxedConnection>;

    /// Set an absolute deadline for accepts, `None` clears it
    fn set_deadline(&self, deadline: Option<Instant>) -> Result<()>;

    /// Close the listener, failing every pending and future accept
    fn close(&self) -> Result<()>;

    /// Get the local address
    fn local_addr(&self) -> Result<SocketAddr>;
}

/// Absolute accept deadline shared by listener implementations
#[derive(Debug, Default)]
pub struct AcceptDeadline {
    at: Mutex<Option<Instant>>,
}

impl AcceptDeadline {
    /// Create an empty deadline
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the deadline
    pub fn set(&self, deadline: Option<Instant>) {
        *self.at.lock().unwrap_or_else(PoisonError::into_inner) = deadline;
    }

    /// Get the current deadline
    pub fn get(&self) -> Option<Instant> {
        *self.at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drive `fut` until it completes or the current deadline passes
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.get() {
            Some(at) => tokio::time::timeout_at(tokio::time::Instant::from_std(at), fut)
                .await
                .map_err(|_| Error::Timeout)?,
            None => fut.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline_expires_pending_future() {
        let deadline = AcceptDeadline::new();
        deadline.set(Some(Instant::now() + Duration::from_millis(20)));

        let result = deadline
            .run(std::future::pending::<Result<()>>())
            .await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_past_deadline_fails_immediately() {
        let deadline = AcceptDeadline::new();
        deadline.set(Some(Instant::now() - Duration::from_millis(1)));

        let result = deadline.run(std::future::pending::<Result<()>>()).await;
        assert!(result.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_cleared_deadline_waits_for_future() {
        let deadline = AcceptDeadline::new();
        deadline.set(Some(Instant::now()));
        deadline.set(None);
        assert!(deadline.get().is_none());

        let value = deadline
            .run(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
