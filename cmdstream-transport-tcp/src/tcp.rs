//! TCP transport implementation for cmdstream
//!
//! [`TcpListener`] wraps a tokio listener and adds the two capabilities the
//! connection receiver relies on: an absolute accept deadline and a close
//! that wakes a pending accept. Closing releases the socket, so clients
//! connecting afterwards are refused instead of queueing in the backlog.

use cmdstream_core::{
    transport::{AcceptDeadline, BoxedConnection, Connection, Listener},
    Error, Result,
};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream as TokioTcpStream};
use tokio_util::sync::CancellationToken;

/// TCP listener with accept deadlines
#[derive(Debug)]
pub struct TcpListener {
    listener: Mutex<Option<Arc<TokioTcpListener>>>,
    local_addr: SocketAddr,
    deadline: AcceptDeadline,
    closed: CancellationToken,
}

impl TcpListener {
    /// Create a new TCP listener bound to the given address
    pub async fn bind(addr: impl tokio::net::ToSocketAddrs) -> Result<Self> {
        let listener = TokioTcpListener::bind(addr).await.map_err(Error::Io)?;
        Self::from_tokio(listener)
    }

    /// Wrap an already bound tokio listener
    pub fn from_tokio(listener: TokioTcpListener) -> Result<Self> {
        let local_addr = listener.local_addr().map_err(Error::Io)?;

        Ok(Self {
            listener: Mutex::new(Some(Arc::new(listener))),
            local_addr,
            deadline: AcceptDeadline::new(),
            closed: CancellationToken::new(),
        })
    }

    /// Accept a TCP connection, honouring the deadline and close signal
    pub async fn accept_tcp(&self) -> Result<TcpConnection> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::ListenerClosed)?;

        let accept = async {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => Err(Error::ListenerClosed),
                accepted = listener.accept() => accepted.map_err(Error::Io),
            }
        };
        let (stream, peer_addr) = self.deadline.run(accept).await?;

        TcpConnection::from_tokio(stream, peer_addr)
    }

    /// Check whether the listener has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait::async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> Result<BoxedConnection> {
        let conn = self.accept_tcp().await?;
        Ok(Box::new(conn))
    }

    fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::ListenerClosed);
        }
        self.deadline.set(deadline);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.cancel();
        // Pending accepts hold their own handle until the cancellation wakes them.
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(listener);
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

/// Accepted TCP connection
#[derive(Debug)]
pub struct TcpConnection {
    stream: TokioTcpStream,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
}

impl TcpConnection {
    /// Wrap an accepted tokio stream
    pub fn from_tokio(stream: TokioTcpStream, peer_addr: SocketAddr) -> Result<Self> {
        let local_addr = stream.local_addr().map_err(Error::Io)?;
        stream.set_nodelay(true).map_err(Error::Io)?;

        Ok(Self {
            stream,
            peer_addr,
            local_addr,
        })
    }

    /// Get a reference to the underlying stream
    pub fn get_ref(&self) -> &TokioTcpStream {
        &self.stream
    }

    /// Consume the connection, returning the underlying stream
    pub fn into_inner(self) -> TokioTcpStream {
        self.stream
    }
}

impl Connection for TcpConnection {
    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl AsyncRead for TcpConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
