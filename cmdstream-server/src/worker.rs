//! Worker pool
//!
//! Workers take connections from the dispatch queue and hand each one to the
//! delegate. A failing delegate loses only its own connection: the failure
//! goes to the lost-connection callback and the worker moves on.

use crate::error::ServerError;
use crate::handler::{BoxedDelegate, Delegate, LostConnCallback};
use crate::queue::ConnQueue;
use crate::task_group::{BoxedTask, Task};
use cmdstream_core::{Connection, Error};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Worker task
pub struct Worker {
    index: usize,
    queue: ConnQueue,
    delegate: BoxedDelegate,
    callback: Option<LostConnCallback>,
    stop: CancellationToken,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("index", &self.index)
            .field("queue", &self.queue)
            .field("stopped", &self.stop.is_cancelled())
            .finish()
    }
}

impl Worker {
    /// Create a worker with the given task index
    pub fn new(
        index: usize,
        queue: ConnQueue,
        delegate: BoxedDelegate,
        callback: Option<LostConnCallback>,
    ) -> Self {
        Self {
            index,
            queue,
            delegate,
            callback,
            stop: CancellationToken::new(),
        }
    }

    /// Task index of the worker
    pub fn index(&self) -> usize {
        self.index
    }

    async fn next_connection(&self) -> Option<cmdstream_core::BoxedConnection> {
        if !self.stop.is_cancelled() {
            tokio::select! {
                biased;
                conn = self.queue.pop() => return conn,
                _ = self.stop.cancelled() => {}
            }
        }

        // Once stopped, only connections that are already queued are taken.
        self.queue.try_pop().await
    }
}

#[async_trait::async_trait]
impl Task<ServerError> for Worker {
    async fn run(&self) -> Result<(), ServerError> {
        tracing::debug!(worker = self.index, "worker started");

        while let Some(conn) = self.next_connection().await {
            #[cfg(feature = "metrics")]
            metrics::gauge!("cmdstream_server_dispatch_queue_depth").set(self.queue.depth() as f64);

            let peer_addr = conn.peer_addr();
            tracing::trace!(worker = self.index, peer = %peer_addr, "connection dispatched");

            let outcome = AssertUnwindSafe(self.delegate.handle(conn))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Error::Other("delegate panicked".to_string())));

            if let Err(err) = outcome {
                tracing::warn!(worker = self.index, peer = %peer_addr, error = %err, "connection lost");

                #[cfg(feature = "metrics")]
                metrics::counter!("cmdstream_server_connections_lost_total").increment(1);

                if let Some(callback) = &self.callback {
                    callback(peer_addr, &err);
                }
            }
        }

        tracing::debug!(worker = self.index, "worker finished");
        Ok(())
    }

    fn stop(&self) {
        self.stop.cancel();
    }
}

/// Builds the worker tasks of one `serve` call
pub trait WorkerFactory: Send + Sync + 'static {
    /// Build `count` workers consuming `queue`
    ///
    /// Workers are numbered `1..=count`; index 0 belongs to the connection
    /// receiver.
    fn build(
        &self,
        count: usize,
        queue: ConnQueue,
        delegate: BoxedDelegate,
        callback: Option<LostConnCallback>,
    ) -> Vec<BoxedTask<ServerError>>;
}

/// Factory building plain [`Worker`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultWorkerFactory;

impl WorkerFactory for DefaultWorkerFactory {
    fn build(
        &self,
        count: usize,
        queue: ConnQueue,
        delegate: BoxedDelegate,
        callback: Option<LostConnCallback>,
    ) -> Vec<BoxedTask<ServerError>> {
        (1..=count)
            .map(|index| {
                Arc::new(Worker::new(
                    index,
                    queue.clone(),
                    delegate.clone(),
                    callback.clone(),
                )) as BoxedTask<ServerError>
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::from_fn;
    use crate::queue::dispatch_queue;
    use cmdstream_core::{BoxedConnection, Listener};
    use cmdstream_transport_tcp::TcpListener;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    async fn connections(n: usize) -> (Vec<BoxedConnection>, Vec<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut conns = Vec::new();
        let mut clients = Vec::new();
        for _ in 0..n {
            clients.push(TcpStream::connect(addr).await.unwrap());
            conns.push(listener.accept().await.unwrap());
        }
        (conns, clients)
    }

    fn recording_callback() -> (LostConnCallback, Arc<Mutex<Vec<(SocketAddr, String)>>>) {
        let lost = Arc::new(Mutex::new(Vec::new()));
        let callback: LostConnCallback = {
            let lost = lost.clone();
            Arc::new(move |addr: SocketAddr, err: &Error| {
                lost.lock().unwrap().push((addr, err.to_string()));
            })
        };
        (callback, lost)
    }

    #[tokio::test]
    async fn test_failed_delegate_reports_once_and_continues() {
        let (conns, mut clients) = connections(2).await;
        let failing_peer = clients[0].local_addr().unwrap();
        let (sender, queue) = dispatch_queue(2);

        // First byte decides: 'x' fails the connection, anything else succeeds.
        let delegate: BoxedDelegate = Arc::new(from_fn(|mut conn: BoxedConnection| async move {
            use tokio::io::AsyncReadExt;
            let mut byte = [0u8; 1];
            conn.read_exact(&mut byte).await?;
            if byte[0] == b'x' {
                return Err(Error::Other("bad command".to_string()));
            }
            Ok(())
        }));

        clients[0].write_all(b"x").await.unwrap();
        clients[1].write_all(b"y").await.unwrap();
        for conn in conns {
            sender.push(conn).await.unwrap();
        }
        drop(sender);

        let (callback, lost) = recording_callback();
        let worker = Worker::new(1, queue, delegate, Some(callback));
        tokio::time::timeout(Duration::from_secs(1), worker.run())
            .await
            .unwrap()
            .unwrap();

        let lost = lost.lock().unwrap();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].0, failing_peer);
        assert_eq!(lost[0].1, "Error: bad command");
    }

    #[tokio::test]
    async fn test_panicking_delegate_is_a_lost_connection() {
        let (conns, _clients) = connections(1).await;
        let (sender, queue) = dispatch_queue(1);
        let delegate: BoxedDelegate = Arc::new(from_fn(|_conn: BoxedConnection| async move {
            if true {
                panic!("delegate bug");
            }
            Ok(())
        }));

        for conn in conns {
            sender.push(conn).await.unwrap();
        }
        drop(sender);

        let (callback, lost) = recording_callback();
        let worker = Worker::new(1, queue, delegate, Some(callback));
        assert!(worker.run().await.is_ok());
        assert_eq!(lost.lock().unwrap()[0].1, "Error: delegate panicked");
    }

    #[tokio::test]
    async fn test_stop_ends_idle_worker() {
        let (_sender, queue) = dispatch_queue(1);
        let delegate: BoxedDelegate = Arc::new(from_fn(|_conn: BoxedConnection| async { Ok(()) }));
        let worker = Arc::new(Worker::new(3, queue, delegate, None));

        let running = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        worker.stop();
        worker.stop();

        let result = tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_stop_prefers_queued_connections() {
        let (conns, _clients) = connections(2).await;
        let (sender, queue) = dispatch_queue(2);
        for conn in conns {
            sender.push(conn).await.unwrap();
        }
        drop(sender);

        let handled = Arc::new(Mutex::new(0usize));
        let delegate: BoxedDelegate = {
            let handled = handled.clone();
            Arc::new(from_fn(move |_conn: BoxedConnection| {
                let handled = handled.clone();
                async move {
                    *handled.lock().unwrap() += 1;
                    Ok(())
                }
            }))
        };

        let worker = Worker::new(1, queue, delegate, None);
        worker.stop();
        worker.run().await.unwrap();
        assert_eq!(*handled.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stopped_workers_share_queued_connections() {
        let (conns, _clients) = connections(4).await;
        let (sender, queue) = dispatch_queue(4);
        for conn in conns {
            sender.push(conn).await.unwrap();
        }

        let counting = || {
            let handled = Arc::new(Mutex::new(0usize));
            let delegate: BoxedDelegate = {
                let handled = handled.clone();
                Arc::new(from_fn(move |_conn: BoxedConnection| {
                    let handled = handled.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        *handled.lock().unwrap() += 1;
                        Ok(())
                    }
                }))
            };
            (delegate, handled)
        };
        let (first_delegate, first_handled) = counting();
        let (second_delegate, second_handled) = counting();

        let first = Worker::new(1, queue.clone(), first_delegate, None);
        let second = Worker::new(2, queue.clone(), second_delegate, None);
        first.stop();
        second.stop();

        // The sender stays open, so only the queued connections are taken.
        let (a, b) = tokio::time::timeout(Duration::from_secs(1), async {
            tokio::join!(first.run(), second.run())
        })
        .await
        .unwrap();
        assert!(a.is_ok() && b.is_ok());

        let first_handled = *first_handled.lock().unwrap();
        let second_handled = *second_handled.lock().unwrap();
        assert_eq!(first_handled + second_handled, 4);
        assert!(first_handled >= 1);
        assert!(second_handled >= 1);
        assert_eq!(queue.depth(), 0);
        drop(sender);
    }

    #[test]
    fn test_default_factory_numbers_workers_from_one() {
        let (_sender, queue) = dispatch_queue(3);
        let delegate: BoxedDelegate = Arc::new(from_fn(|_conn: BoxedConnection| async { Ok(()) }));

        let workers = DefaultWorkerFactory.build(3, queue, delegate, None);
        assert_eq!(workers.len(), 3);
    }
}
