//! Connection receiver
//!
//! The receiver is the only producer of the dispatch queue. It accepts with
//! a rolling deadline so that a pending stop request is noticed at least
//! once per accept timeout, and it decides how the queue ends: sealed after
//! a graceful shutdown, closed after a forced stop or a listener failure.
//!
//! Both stop requests close the listener at once. After a graceful shutdown
//! the receiver finishes while the workers drain the sealed queue; a close
//! in that phase still drops whatever is left in the queue.

use crate::error::ServerError;
use crate::queue::{ConnQueue, ConnSender};
use crate::task_group::Task;
use cmdstream_core::{Connection, Error, Listener};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

const RUNNING: u8 = 0;
const SHUTTING_DOWN: u8 = 1;
const CLOSING: u8 = 2;
const HALTING: u8 = 3;
const DRAINING: u8 = 4;
const STOPPED: u8 = 5;

/// Accepts connections and feeds them to the dispatch queue
pub struct ConnReceiver {
    listener: Arc<dyn Listener>,
    sender: Mutex<Option<ConnSender>>,
    queue: ConnQueue,
    accept_timeout: Duration,
    state: AtomicU8,
    shutdown_requested: AtomicBool,
    close_requested: AtomicBool,
}

impl std::fmt::Debug for ConnReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnReceiver")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("queue", &self.queue)
            .field("accept_timeout", &self.accept_timeout)
            .field("state", &self.state.load(Ordering::SeqCst))
            .finish()
    }
}

impl ConnReceiver {
    /// Create a receiver producing into `sender`
    pub fn new(
        listener: Arc<dyn Listener>,
        sender: ConnSender,
        queue: ConnQueue,
        accept_timeout: Duration,
    ) -> Self {
        Self {
            listener,
            sender: Mutex::new(Some(sender)),
            queue,
            accept_timeout,
            state: AtomicU8::new(RUNNING),
            shutdown_requested: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
        }
    }

    /// Stop accepting and let the workers drain the queue
    pub fn shutdown(&self) -> Result<(), ServerError> {
        self.state
            .compare_exchange(RUNNING, SHUTTING_DOWN, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| ServerError::ReceiverStopped)?;
        self.shutdown_requested.store(true, Ordering::SeqCst);
        tracing::debug!("connection receiver shutting down");
        self.close_listener();
        Ok(())
    }

    /// Stop accepting, close the listener and drop every queued connection
    ///
    /// Also escalates a shutdown, including one whose receiver already
    /// finished while the workers drain the queue.
    pub async fn close(&self) -> Result<(), ServerError> {
        if !self.request_stop(CLOSING) {
            return Err(ServerError::ReceiverStopped);
        }
        self.close_requested.store(true, Ordering::SeqCst);
        tracing::debug!("connection receiver closing");

        self.queue.cancel();
        let closed = self.listener.close().map_err(ServerError::Transport);
        let dropped = self.queue.close().await;
        tracing::debug!(dropped, "dispatch queue closed");
        closed
    }

    /// Local address of the listener
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        self.listener.local_addr().map_err(ServerError::Transport)
    }

    /// Check whether [`shutdown`](ConnReceiver::shutdown) was called
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Check whether [`close`](ConnReceiver::close) was called
    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }

    fn request_stop(&self, to: u8) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            let allowed = match to {
                CLOSING => matches!(current, RUNNING | SHUTTING_DOWN | DRAINING),
                _ => matches!(current, RUNNING | SHUTTING_DOWN),
            };
            if !allowed {
                return false;
            }
            match self
                .state
                .compare_exchange(current, to, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn stop_requested(&self) -> bool {
        self.state.load(Ordering::SeqCst) != RUNNING
    }

    fn close_listener(&self) {
        if let Err(e) = self.listener.close() {
            tracing::debug!(error = %e, "failed to close listener");
        }
    }

    fn drop_connection(&self, reason: &'static str) {
        tracing::debug!(reason, "connection dropped");

        #[cfg(feature = "metrics")]
        metrics::counter!("cmdstream_server_connections_dropped_total").increment(1);
    }

    /// Leave the accept loop, returning the state it ended in
    ///
    /// A clean graceful stop moves to `DRAINING` so that a later close can
    /// still take over; every other ending is final.
    fn finish(&self, clean: bool) -> u8 {
        if clean
            && self
                .state
                .compare_exchange(SHUTTING_DOWN, DRAINING, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return DRAINING;
        }
        self.state.swap(STOPPED, Ordering::SeqCst)
    }

    async fn accept_loop(&self, sender: &ConnSender) -> Result<(), Error> {
        loop {
            if self.stop_requested() {
                return Ok(());
            }

            let accepted = match self
                .listener
                .set_deadline(Some(Instant::now() + self.accept_timeout))
            {
                Ok(()) => self.listener.accept().await,
                Err(e) => Err(e),
            };

            match accepted {
                Ok(conn) => {
                    if self.stop_requested() {
                        drop(conn);
                        self.drop_connection("accepted after stop request");
                        continue;
                    }

                    #[cfg(feature = "metrics")]
                    metrics::counter!("cmdstream_server_connections_accepted_total").increment(1);
                    tracing::trace!(peer = %conn.peer_addr(), "connection accepted");

                    if let Err(conn) = sender.push(conn).await {
                        drop(conn);
                        self.drop_connection("dispatch queue closed");
                    }

                    #[cfg(feature = "metrics")]
                    metrics::gauge!("cmdstream_server_dispatch_queue_depth")
                        .set(self.queue.depth() as f64);
                }
                Err(e) if e.is_timeout() => continue,
                Err(_) if self.stop_requested() => return Ok(()),
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "failed to accept connection");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait::async_trait]
impl Task<ServerError> for ConnReceiver {
    async fn run(&self) -> Result<(), ServerError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ServerError::ReceiverStopped)?;

        tracing::debug!(accept_timeout = ?self.accept_timeout, "connection receiver started");
        let result = self.accept_loop(&sender).await;
        let state = self.finish(result.is_ok());
        self.close_listener();

        match (result, state) {
            (Err(e), _) => {
                tracing::error!(error = %e, "listener failed");
                self.queue.close().await;
                Err(ServerError::Accept(e))
            }
            (Ok(()), DRAINING) => {
                drop(sender);
                tracing::debug!(queued = self.queue.depth(), "dispatch queue sealed");
                Ok(())
            }
            (Ok(()), CLOSING) => {
                let dropped = self.queue.close().await;
                tracing::debug!(dropped, "dispatch queue closed");
                Err(ServerError::Closed)
            }
            (Ok(()), _) => {
                let dropped = self.queue.close().await;
                tracing::debug!(dropped, "dispatch queue closed after halt");
                Ok(())
            }
        }
    }

    fn stop(&self) {
        if self.request_stop(HALTING) {
            tracing::debug!("connection receiver halting");
            self.queue.cancel();
            self.close_listener();
        }
    }
}
