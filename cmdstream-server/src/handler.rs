//! Connection delegates
//!
//! A [`Delegate`] owns one accepted connection for its whole lifetime: it
//! reads commands, writes results and returns when the connection is done.
//! The server never interrupts a running delegate.

use cmdstream_core::{transport::BoxedConnection, Error, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

/// Trait for handling accepted connections
#[async_trait::async_trait]
pub trait Delegate: Send + Sync + 'static {
    /// Handle one connection until it is finished
    ///
    /// An error marks the connection as lost and is reported to the
    /// lost-connection callback.
    async fn handle(&self, conn: BoxedConnection) -> Result<()>;
}

#[async_trait::async_trait]
impl<D: Delegate + ?Sized> Delegate for Arc<D> {
    async fn handle(&self, conn: BoxedConnection) -> Result<()> {
        (**self).handle(conn).await
    }
}

/// Shared delegate type
pub type BoxedDelegate = Arc<dyn Delegate>;

/// Callback invoked once per lost connection with its peer address and the
/// delegate's error
pub type LostConnCallback = Arc<dyn Fn(SocketAddr, &Error) + Send + Sync>;

/// Function-based delegate
#[derive(Clone)]
pub struct FnDelegate<F> {
    f: F,
}

impl<F> FnDelegate<F> {
    /// Create a new function-based delegate
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait::async_trait]
impl<F, Fut> Delegate for FnDelegate<F>
where
    F: Fn(BoxedConnection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, conn: BoxedConnection) -> Result<()> {
        (self.f)(conn).await
    }
}

impl<F> std::fmt::Debug for FnDelegate<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnDelegate")
            .field("f", &"<function>")
            .finish()
    }
}

/// Create a delegate from a function
pub fn from_fn<F, Fut>(f: F) -> FnDelegate<F>
where
    F: Fn(BoxedConnection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnDelegate::new(f)
}
