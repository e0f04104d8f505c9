//! Bounded dispatch queue between the connection receiver and the workers
//!
//! The capacity equals the worker count, so the receiver blocks in
//! [`ConnSender::push`] once every worker is busy and one connection waits
//! for each of them. The queue ends in one of two ways:
//!
//! - sealed: the [`ConnSender`] is dropped, queued connections still drain
//!   and [`ConnQueue::pop`] returns `None` once the queue is empty;
//! - closed: [`ConnQueue::close`] wakes every waiter and drops whatever is
//!   still queued.

use cmdstream_core::transport::BoxedConnection;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Create a dispatch queue holding at most `capacity` connections
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn dispatch_queue(capacity: usize) -> (ConnSender, ConnQueue) {
    let (tx, rx) = mpsc::channel(capacity);
    let closed = CancellationToken::new();
    let depth = Arc::new(AtomicUsize::new(0));

    let sender = ConnSender {
        tx,
        closed: closed.clone(),
        depth: depth.clone(),
    };
    let queue = ConnQueue {
        rx: Arc::new(Mutex::new(rx)),
        closed,
        depth,
        capacity,
    };
    (sender, queue)
}

/// Producer side of the dispatch queue, owned by the connection receiver
#[derive(Debug)]
pub struct ConnSender {
    tx: mpsc::Sender<BoxedConnection>,
    closed: CancellationToken,
    depth: Arc<AtomicUsize>,
}

impl ConnSender {
    /// Enqueue a connection, waiting while the queue is full
    ///
    /// Hands the connection back if the queue was closed before it could be
    /// enqueued.
    pub async fn push(&self, conn: BoxedConnection) -> Result<(), BoxedConnection> {
        if self.closed.is_cancelled() {
            return Err(conn);
        }

        let permit = tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            permit = self.tx.reserve() => permit.ok(),
        };

        match permit {
            Some(permit) => {
                self.depth.fetch_add(1, Ordering::SeqCst);
                permit.send(conn);
                Ok(())
            }
            None => Err(conn),
        }
    }

    /// Check whether the queue was closed
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Consumer side of the dispatch queue, shared by every worker
#[derive(Debug, Clone)]
pub struct ConnQueue {
    rx: Arc<Mutex<mpsc::Receiver<BoxedConnection>>>,
    closed: CancellationToken,
    depth: Arc<AtomicUsize>,
    capacity: usize,
}

impl ConnQueue {
    /// Take the next connection in FIFO order
    ///
    /// Returns `None` when the queue is closed, or sealed and empty.
    pub async fn pop(&self) -> Option<BoxedConnection> {
        if self.closed.is_cancelled() {
            return None;
        }

        let conn = tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            conn = async { self.rx.lock().await.recv().await } => conn,
        }?;

        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(conn)
    }

    /// Take a connection that is already queued, without waiting for new ones
    ///
    /// Returns `None` when nothing is queued or the queue is closed. Only
    /// waits for other consumers that are taking a connection right now.
    pub async fn try_pop(&self) -> Option<BoxedConnection> {
        if self.closed.is_cancelled() || self.depth() == 0 {
            return None;
        }

        let conn = tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            conn = async { self.rx.lock().await.try_recv().ok() } => conn,
        }?;

        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(conn)
    }

    /// Signal closure without draining
    ///
    /// Blocked producers and consumers wake up at once; queued connections
    /// stay until [`close`](ConnQueue::close) drains them.
    pub fn cancel(&self) {
        self.closed.cancel();
    }

    /// Close the queue, dropping every queued connection
    ///
    /// Wakes blocked producers and consumers. Returns the number of
    /// connections that were dropped; closing again returns zero.
    pub async fn close(&self) -> usize {
        self.closed.cancel();

        let mut rx = self.rx.lock().await;
        rx.close();

        let mut dropped = 0;
        while let Ok(conn) = rx.try_recv() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            drop(conn);
            dropped += 1;
        }
        dropped
    }

    /// Check whether the queue was closed
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Number of connections waiting for a worker
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Maximum number of waiting connections
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
