//! TLS listener for cmdstream
//!
//! [`TlsListener`] accepts TCP connections from a [`TcpListener`] and hands
//! them out before the TLS handshake has run. A [`TlsConnection`] completes
//! the handshake on its first read or write, bounded by the handshake
//! timeout, so a slow or silent client only ever holds up the worker that
//! serves it. The accept deadline set on the TLS listener is the deadline of
//! the TCP accept.

use cmdstream_core::{
    transport::{BoxedConnection, Connection, Listener},
    Error, Result,
};
use cmdstream_transport_tcp::{TcpConnection, TcpListener};
use rustls::ServerConfig;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;
use tokio_rustls::{server::TlsStream, Accept, TlsAcceptor};

pub use cmdstream_core::DEFAULT_HANDSHAKE_TIMEOUT;

/// TLS listener wrapping a [`TcpListener`]
pub struct TlsListener {
    inner: TcpListener,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl std::fmt::Debug for TlsListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsListener")
            .field("inner", &self.inner)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

impl TlsListener {
    /// Wrap a TCP listener with the given rustls server configuration
    pub fn new(inner: TcpListener, config: Arc<ServerConfig>) -> Self {
        Self {
            inner,
            acceptor: TlsAcceptor::from(config),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Bind a TCP listener to `addr` and wrap it
    pub async fn bind(
        addr: impl tokio::net::ToSocketAddrs,
        config: Arc<ServerConfig>,
    ) -> Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self::new(inner, config))
    }

    /// Set the bound on a single handshake
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Get the underlying TCP listener
    pub fn get_ref(&self) -> &TcpListener {
        &self.inner
    }

    /// Accept a TCP connection whose TLS handshake is still pending
    pub async fn accept_tls(&self) -> Result<TlsConnection> {
        let tcp = self.inner.accept_tcp().await?;
        let peer_addr = tcp.peer_addr();
        let local_addr = tcp.local_addr();

        Ok(TlsConnection {
            state: State::Handshaking {
                accept: self.acceptor.accept(tcp),
                timer: None,
                timeout: self.handshake_timeout,
            },
            peer_addr,
            local_addr,
        })
    }
}

#[async_trait::async_trait]
impl Listener for TlsListener {
    async fn accept(&self) -> Result<BoxedConnection> {
        let conn = self.accept_tls().await?;
        Ok(Box::new(conn))
    }

    fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.inner.set_deadline(deadline)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr()
    }
}

enum State {
    Handshaking {
        accept: Accept<TcpConnection>,
        // Started on the first poll, so time spent queued does not count.
        timer: Option<Pin<Box<Sleep>>>,
        timeout: Duration,
    },
    Established(Box<TlsStream<TcpConnection>>),
    Failed(io::ErrorKind, String),
}

/// Server side of a TLS connection
///
/// The handshake runs on the first read or write, or through
/// [`handshake`](TlsConnection::handshake). A failed or timed-out handshake
/// fails that call and every later one.
pub struct TlsConnection {
    state: State,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for TlsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            State::Handshaking { .. } => "handshaking",
            State::Established(_) => "established",
            State::Failed(..) => "failed",
        };
        f.debug_struct("TlsConnection")
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .field("state", &state)
            .finish()
    }
}

impl TlsConnection {
    /// Complete the TLS handshake
    ///
    /// Returns immediately once the handshake is done. Failures are reported
    /// as [`Error::Handshake`].
    pub async fn handshake(&mut self) -> Result<()> {
        std::future::poll_fn(|cx| self.poll_handshake(cx))
            .await
            .map_err(|e| Error::Handshake(e.to_string()))
    }

    /// Check whether the handshake completed successfully
    pub fn is_established(&self) -> bool {
        matches!(self.state, State::Established(_))
    }

    /// Get the negotiated server name, if the client sent one
    ///
    /// Always `None` before the handshake completed.
    pub fn server_name(&self) -> Option<&str> {
        match &self.state {
            State::Established(stream) => stream.get_ref().1.server_name(),
            _ => None,
        }
    }

    /// Consume the connection, returning the tokio-rustls stream
    ///
    /// `None` unless the handshake completed.
    pub fn into_inner(self) -> Option<TlsStream<TcpConnection>> {
        match self.state {
            State::Established(stream) => Some(*stream),
            _ => None,
        }
    }

    fn poll_handshake(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let outcome = match &mut self.state {
            State::Established(_) => return Poll::Ready(Ok(())),
            State::Failed(kind, message) => {
                return Poll::Ready(Err(io::Error::new(*kind, message.clone())))
            }
            State::Handshaking {
                accept,
                timer,
                timeout,
            } => {
                let timer = timer.get_or_insert_with(|| Box::pin(tokio::time::sleep(*timeout)));
                match Pin::new(accept).poll(cx) {
                    Poll::Ready(Ok(stream)) => Ok(stream),
                    Poll::Ready(Err(e)) => Err(io::Error::new(
                        e.kind(),
                        format!("TLS handshake with {} failed: {}", self.peer_addr, e),
                    )),
                    Poll::Pending => {
                        ready!(timer.as_mut().poll(cx));
                        Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!(
                                "TLS handshake with {} timed out after {:?}",
                                self.peer_addr, timeout
                            ),
                        ))
                    }
                }
            }
        };

        match outcome {
            Ok(stream) => {
                self.state = State::Established(Box::new(stream));
                Poll::Ready(Ok(()))
            }
            Err(e) => {
                self.state = State::Failed(e.kind(), e.to_string());
                Poll::Ready(Err(e))
            }
        }
    }
}

impl Connection for TlsConnection {
    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl AsyncRead for TlsConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_handshake(cx))?;
        match &mut this.state {
            State::Established(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            _ => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }
}

impl AsyncWrite for TlsConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_handshake(cx))?;
        match &mut this.state {
            State::Established(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            _ => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().state {
            State::Established(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            _ => Poll::Ready(Ok(())),
        }
    }

    // Shutting down before the handshake leaves the TCP close to drop.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().state {
            State::Established(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            _ => Poll::Ready(Ok(())),
        }
    }
}
