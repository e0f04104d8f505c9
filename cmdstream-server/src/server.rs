//! Server implementation
//!
//! A [`Server`] moves between three states. `serve` is the only way into
//! [`ServerState::Serving`]; it runs the connection receiver and the workers
//! as one task group and always ends with an error, which is
//! [`ServerError::Shutdown`] or [`ServerError::Closed`] when the stop was
//! requested through [`Server::shutdown`] or [`Server::close`]. Dropping a
//! `serve` future stops its tasks and leaves the server in
//! `Terminated(Failed)`, ready to serve again.

use crate::{
    config::{ServerConfig, TlsConfig},
    error::ServerError,
    handler::{BoxedDelegate, Delegate, LostConnCallback},
    logging,
    queue::dispatch_queue,
    receiver::ConnReceiver,
    task_group::{Task, TaskGroup},
    worker::{DefaultWorkerFactory, WorkerFactory},
};
use cmdstream_core::{Error, Listener};
use cmdstream_transport_tcp::TcpListener;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Lifecycle state of a [`Server`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Never served
    NotServing,
    /// A `serve` call is running
    Serving,
    /// The last `serve` call ended
    Terminated(Termination),
}

/// How the last `serve` call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Stopped by [`Server::shutdown`]
    Shutdown,
    /// Stopped by [`Server::close`]
    Closed,
    /// Stopped by a listener or task failure
    Failed,
}

// Never held across an await.
struct Lifecycle {
    state: ServerState,
    receiver: Option<Arc<ConnReceiver>>,
}

/// Ends the lifecycle of one `serve` call, also when its future is dropped
struct ServingGuard<'a> {
    lifecycle: &'a Mutex<Lifecycle>,
    receiver: Arc<ConnReceiver>,
    finished: bool,
}

impl ServingGuard<'_> {
    fn finish(mut self, termination: Termination) {
        self.finished = true;
        self.terminate(termination);
    }

    fn terminate(&self, termination: Termination) {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        lifecycle.receiver = None;
        lifecycle.state = ServerState::Terminated(termination);
    }
}

impl Drop for ServingGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("serve cancelled, stopping the server");
            self.receiver.stop();
            self.terminate(Termination::Failed);
        }
    }
}

/// Connection-dispatch server
pub struct Server {
    config: ServerConfig,
    delegate: BoxedDelegate,
    factory: Arc<dyn WorkerFactory>,
    lifecycle: Mutex<Lifecycle>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("delegate", &"<delegate>")
            .field("factory", &"<worker factory>")
            .finish()
    }
}

impl Server {
    /// Create a new server with the given config and delegate
    pub fn new<D: Delegate>(config: ServerConfig, delegate: D) -> Self {
        Self::with_workers(config, delegate, DefaultWorkerFactory)
    }

    /// Create a new server whose workers come from `factory`
    pub fn with_workers<D, F>(config: ServerConfig, delegate: D, factory: F) -> Self
    where
        D: Delegate,
        F: WorkerFactory,
    {
        Self {
            config,
            delegate: Arc::new(delegate),
            factory: Arc::new(factory),
            lifecycle: Mutex::new(Lifecycle {
                state: ServerState::NotServing,
                receiver: None,
            }),
        }
    }

    /// Create a server builder
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Get the configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the current lifecycle state
    pub async fn state(&self) -> ServerState {
        self.lock_lifecycle().state
    }

    /// Local address of the listener currently being served
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.receiver().and_then(|receiver| receiver.local_addr().ok())
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn receiver(&self) -> Option<Arc<ConnReceiver>> {
        self.lock_lifecycle().receiver.clone()
    }

    /// Serve connections accepted by `listener` until stopped
    ///
    /// Never returns `Ok`. A requested stop ends with
    /// [`ServerError::Shutdown`] or [`ServerError::Closed`]; a listener
    /// failure ends with [`ServerError::Accept`].
    ///
    /// Cancel safe: dropping the future stops every task of this call.
    pub async fn serve<L: Listener>(&self, listener: L) -> Result<Infallible, ServerError> {
        let workers = self.config.workers;
        if workers == 0 {
            return Err(ServerError::NoWorkers);
        }

        let (receiver, group) = {
            let mut lifecycle = self.lock_lifecycle();
            if lifecycle.receiver.is_some() {
                return Err(ServerError::AlreadyServing);
            }

            let (sender, queue) = dispatch_queue(workers);
            let receiver = Arc::new(ConnReceiver::new(
                Arc::new(listener),
                sender,
                queue.clone(),
                self.config.accept_timeout,
            ));

            let mut group: TaskGroup<ServerError> = TaskGroup::new();
            group.push(receiver.clone());
            for worker in self.factory.build(
                workers,
                queue,
                self.delegate.clone(),
                self.config.lost_conn_callback.clone(),
            ) {
                group.push(worker);
            }

            lifecycle.receiver = Some(receiver.clone());
            lifecycle.state = ServerState::Serving;
            (receiver, group)
        };
        let guard = ServingGuard {
            lifecycle: &self.lifecycle,
            receiver: receiver.clone(),
            finished: false,
        };

        logging::serving_started(receiver.local_addr().ok(), workers);

        let (err, task) = match group.run().await {
            Ok(()) if receiver.close_requested() => (ServerError::Closed, None),
            Ok(()) if receiver.shutdown_requested() => (ServerError::Shutdown, None),
            Ok(()) => (ServerError::UnexpectedTermination, None),
            Err(failures) => {
                let (index, err) = failures.into_first();
                (err, Some(index))
            }
        };
        logging::serving_ended(&err, task);

        let termination = match err {
            ServerError::Shutdown => Termination::Shutdown,
            ServerError::Closed => Termination::Closed,
            _ => Termination::Failed,
        };

        guard.finish(termination);
        Err(err)
    }

    /// Bind a listener to `addr` and serve it
    ///
    /// The listener is wrapped with TLS when the configuration has a
    /// [`TlsConfig`].
    pub async fn listen_and_serve(
        &self,
        addr: impl tokio::net::ToSocketAddrs,
    ) -> Result<Infallible, ServerError> {
        if self.config.workers == 0 {
            return Err(ServerError::NoWorkers);
        }

        match &self.config.tls {
            None => {
                let listener = TcpListener::bind(addr).await?;
                self.serve(listener).await
            }
            Some(tls) => self.listen_and_serve_tls(addr, tls).await,
        }
    }

    #[cfg(feature = "tls-transport")]
    async fn listen_and_serve_tls(
        &self,
        addr: impl tokio::net::ToSocketAddrs,
        tls: &TlsConfig,
    ) -> Result<Infallible, ServerError> {
        let tls_config = tls.build()?;
        let listener = TcpListener::bind(addr).await?;
        let listener = cmdstream_transport_tls::TlsListener::new(listener, tls_config)
            .with_handshake_timeout(self.config.handshake_timeout);
        self.serve(listener).await
    }

    #[cfg(not(feature = "tls-transport"))]
    async fn listen_and_serve_tls(
        &self,
        _addr: impl tokio::net::ToSocketAddrs,
        _tls: &TlsConfig,
    ) -> Result<Infallible, ServerError> {
        Err(ServerError::Config(
            "TLS requires the `tls-transport` feature".to_string(),
        ))
    }

    /// Stop accepting and let queued connections finish
    ///
    /// `serve` returns [`ServerError::Shutdown`] once every worker is done.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        match self.receiver() {
            Some(receiver) => receiver.shutdown(),
            None => Err(ServerError::NotServing),
        }
    }

    /// Stop accepting, close the listener and drop queued connections
    ///
    /// Running delegates are not interrupted; `serve` returns
    /// [`ServerError::Closed`] once they are done.
    pub async fn close(&self) -> Result<(), ServerError> {
        match self.receiver() {
            Some(receiver) => receiver.close().await,
            None => Err(ServerError::NotServing),
        }
    }
}

/// Server builder
#[derive(Debug, Clone, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
}

impl ServerBuilder {
    /// Create a new server builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of workers
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Set the period of the receiver's timed accept
    pub fn accept_timeout(mut self, timeout: Duration) -> Self {
        self.config.accept_timeout = timeout;
        self
    }

    /// Set the TLS handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Configure TLS for `listen_and_serve`
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.config.tls = Some(tls);
        self
    }

    /// Set the callback invoked for every lost connection
    pub fn lost_conn_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(SocketAddr, &Error) + Send + Sync + 'static,
    {
        let callback: LostConnCallback = Arc::new(callback);
        self.config.lost_conn_callback = Some(callback);
        self
    }

    /// Build the server with the default worker pool
    pub fn build<D: Delegate>(self, delegate: D) -> Result<Server, ServerError> {
        self.config.validate()?;
        Ok(Server::new(self.config, delegate))
    }

    /// Build the server with workers from a custom factory
    pub fn build_with_workers<D, F>(self, delegate: D, factory: F) -> Result<Server, ServerError>
    where
        D: Delegate,
        F: WorkerFactory,
    {
        self.config.validate()?;
        Ok(Server::with_workers(self.config, delegate, factory))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::from_fn;
    use cmdstream_core::BoxedConnection;

    fn noop_server(workers: usize) -> Server {
        Server::builder()
            .workers(workers)
            .accept_timeout(Duration::from_millis(20))
            .build(from_fn(|_conn: BoxedConnection| async { Ok(()) }))
            .unwrap()
    }

    #[test]
    fn test_server_builder() {
        let server = Server::builder()
            .workers(4)
            .accept_timeout(Duration::from_millis(250))
            .handshake_timeout(Duration::from_secs(2))
            .lost_conn_callback(|_addr, _err| {})
            .build(from_fn(|_conn: BoxedConnection| async { Ok(()) }))
            .unwrap();

        assert_eq!(server.config().workers, 4);
        assert_eq!(server.config().accept_timeout, Duration::from_millis(250));
        assert!(server.config().lost_conn_callback.is_some());
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let result = Server::builder()
            .accept_timeout(Duration::ZERO)
            .build(from_fn(|_conn: BoxedConnection| async { Ok(()) }));
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn test_zero_workers() {
        let server = noop_server(0);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        assert!(matches!(server.serve(listener).await, Err(ServerError::NoWorkers)));
        assert!(matches!(
            server.listen_and_serve("127.0.0.1:0").await,
            Err(ServerError::NoWorkers)
        ));
        assert_eq!(server.state().await, ServerState::NotServing);
    }

    #[tokio::test]
    async fn test_stop_requests_while_not_serving() {
        let server = noop_server(1);

        assert!(matches!(server.shutdown().await, Err(ServerError::NotServing)));
        assert!(matches!(server.close().await, Err(ServerError::NotServing)));
        assert_eq!(server.state().await, ServerState::NotServing);
        assert!(server.local_addr().await.is_none());
    }

    #[cfg(not(feature = "tls-transport"))]
    #[tokio::test]
    async fn test_tls_without_feature() {
        let server = Server::builder()
            .tls(TlsConfig::pem("cert.pem", "key.pem"))
            .build(from_fn(|_conn: BoxedConnection| async { Ok(()) }))
            .unwrap();
        assert!(matches!(
            server.listen_and_serve("127.0.0.1:0").await,
            Err(ServerError::Config(_))
        ));
    }

    #[cfg(feature = "tls-transport")]
    #[tokio::test]
    async fn test_bad_tls_config_is_transport_error() {
        let server = Server::builder()
            .tls(TlsConfig::pem("/nonexistent/cert.pem", "/nonexistent/key.pem"))
            .build(from_fn(|_conn: BoxedConnection| async { Ok(()) }))
            .unwrap();
        assert!(matches!(
            server.listen_and_serve("127.0.0.1:0").await,
            Err(ServerError::Transport(Error::Config(_)))
        ));
        assert_eq!(server.state().await, ServerState::NotServing);
    }

    #[tokio::test]
    async fn test_serve_twice_concurrently() {
        let server = Arc::new(noop_server(1));
        let first = {
            let server = server.clone();
            tokio::spawn(async move {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                server.serve(listener).await
            })
        };

        tokio::time::timeout(Duration::from_secs(1), async {
            while server.state().await != ServerState::Serving {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(matches!(
            server.serve(listener).await,
            Err(ServerError::AlreadyServing)
        ));

        server.shutdown().await.unwrap();
        assert!(matches!(first.await.unwrap(), Err(ServerError::Shutdown)));
        assert_eq!(
            server.state().await,
            ServerState::Terminated(Termination::Shutdown)
        );
    }

    #[tokio::test]
    async fn test_dropped_serve_future_resets_state() {
        let server = Arc::new(noop_server(2));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let cancelled =
            tokio::time::timeout(Duration::from_millis(100), server.serve(listener)).await;
        assert!(cancelled.is_err());
        assert_eq!(
            server.state().await,
            ServerState::Terminated(Termination::Failed)
        );
        assert!(server.local_addr().await.is_none());
        assert!(matches!(server.shutdown().await, Err(ServerError::NotServing)));

        // The stopped receiver releases the old socket.
        tokio::time::timeout(Duration::from_secs(1), async {
            while tokio::net::TcpStream::connect(addr).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let serving = {
            let server = server.clone();
            tokio::spawn(async move {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                server.serve(listener).await
            })
        };
        tokio::time::timeout(Duration::from_secs(1), async {
            while server.state().await != ServerState::Serving {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        server.shutdown().await.unwrap();
        assert!(matches!(serving.await.unwrap(), Err(ServerError::Shutdown)));
    }
}
