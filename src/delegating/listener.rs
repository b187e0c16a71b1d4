//! Front-side listener that splits accepted connections between the local
//! application and worker processes.
//!
//! # Responsibilities
//! - Start every worker before binding the public endpoint
//! - Ask the routing policy about each accepted connection
//! - Forward delegated connections and keep accepting; return local ones
//! - Fall back to local handling when the chosen worker is unavailable
//!
//! # Design Decisions
//! - A failed forward drops that one connection and the loop keeps going
//! - An accept error ends the stream cleanly and closes the socket
//! - A forward in progress is not interrupted by cancellation; cutting it
//!   short could leave half a frame on the control channel

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerPoolConfig;
use crate::delegating::spawner::{ProcessSpawner, WorkerSpawner};
use crate::delegating::supervisor::{StartError, WorkerSupervisor};
use crate::net::{Connection, ConnectionFactory, ConnectionListener, ListenerError, ListenerFactory, Origin};
use crate::observability::metrics;
use crate::routing::{Route, RoutingPolicy};

/// Accepts on the public endpoint and delegates per the routing policy.
pub struct DelegatingListener {
    socket: ArcSwapOption<TcpListener>,
    local_addr: SocketAddr,
    workers: Vec<WorkerSupervisor>,
    policy: Arc<dyn RoutingPolicy>,
    connections: ConnectionFactory,
    accepted: AtomicU64,
    unbound: CancellationToken,
}

impl DelegatingListener {
    pub fn workers(&self) -> &[WorkerSupervisor] {
        &self.workers
    }

    /// Number of connections accepted so far, delegated ones included.
    pub fn accepted_count(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    fn close_socket(&self) {
        self.unbound.cancel();
        if self.socket.swap(None).is_some() {
            tracing::info!(address = %self.local_addr, "Delegating listener unbound");
        }
    }

    /// Try to hand `stream` to a worker. Gives the stream back when the
    /// worker cannot take it and the connection should stay local.
    async fn delegate(&self, index: usize, stream: tokio::net::TcpStream, ordinal: u64) -> Option<tokio::net::TcpStream> {
        let Some(worker) = self.workers.get(index).filter(|w| w.is_connected()) else {
            tracing::warn!(worker = index, ordinal, "Worker unavailable, serving locally");
            return Some(stream);
        };

        match worker.forward(stream).await {
            Ok(()) => {
                metrics::record_delegated(index);
                tracing::debug!(worker = index, pid = ?worker.pid(), ordinal, "Connection delegated");
            }
            Err(e) => {
                metrics::record_forward_failure(index);
                tracing::warn!(worker = index, ordinal, error = %e, "Failed to delegate connection");
            }
        }
        None
    }
}

#[async_trait]
impl ConnectionListener for DelegatingListener {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept(&self, cancel: &CancellationToken) -> Result<Option<Connection>, ListenerError> {
        let Some(socket) = self.socket.load_full() else {
            return Ok(None);
        };

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return Err(ListenerError::Cancelled),
                _ = self.unbound.cancelled() => return Ok(None),
                accepted = socket.accept() => accepted,
            };

            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed, closing delegating listener");
                    self.close_socket();
                    return Ok(None);
                }
            };

            let ordinal = self.accepted.fetch_add(1, Ordering::Relaxed) + 1;
            metrics::record_accepted();

            let stream = match self.policy.route(ordinal, self.workers.len()) {
                Route::Local => stream,
                Route::Worker(index) => match self.delegate(index, stream, ordinal).await {
                    Some(stream) => stream,
                    None => continue,
                },
            };

            match self.connections.create(stream, Origin::Local) {
                Ok(connection) => {
                    metrics::record_local();
                    tracing::debug!(
                        connection_id = %connection.id(),
                        peer_addr = %peer_addr,
                        ordinal,
                        "Connection kept local"
                    );
                    return Ok(Some(connection));
                }
                Err(e) if self.connections.is_disposed() => {
                    tracing::debug!(error = %e, "Connection factory disposed");
                    return Ok(None);
                }
                Err(e) => {
                    tracing::warn!(peer_addr = %peer_addr, error = %e, "Dropping connection");
                }
            }
        }
    }

    async fn unbind(&self) {
        self.close_socket();
    }

    async fn dispose(&self) {
        self.close_socket();
        self.connections.dispose();
        for worker in &self.workers {
            worker.dispose().await;
        }
    }
}

/// Starts the worker pool and binds a [`DelegatingListener`].
pub struct DelegatingListenerFactory {
    config: WorkerPoolConfig,
    policy: Arc<dyn RoutingPolicy>,
    spawner: Arc<dyn WorkerSpawner>,
}

impl DelegatingListenerFactory {
    pub fn new(config: WorkerPoolConfig, policy: Arc<dyn RoutingPolicy>) -> Self {
        let spawner = Arc::new(ProcessSpawner::from_config(&config));
        Self {
            config,
            policy,
            spawner,
        }
    }

    /// Replace the default process spawner.
    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

#[async_trait]
impl ListenerFactory for DelegatingListenerFactory {
    type Listener = DelegatingListener;

    async fn bind(
        &self,
        endpoint: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<DelegatingListener, ListenerError> {
        let mut workers: Vec<WorkerSupervisor> = Vec::with_capacity(self.config.count);

        for index in 0..self.config.count {
            let mut worker = WorkerSupervisor::new(index, self.spawner.clone(), &self.config);
            if let Err(source) = worker.start(cancel).await {
                for started in &workers {
                    started.dispose().await;
                }
                return Err(match source {
                    StartError::Cancelled => ListenerError::Cancelled,
                    source => ListenerError::Start { worker: index, source },
                });
            }
            workers.push(worker);
        }

        let socket = match TcpListener::bind(endpoint).await {
            Ok(socket) => socket,
            Err(source) => {
                for worker in &workers {
                    worker.dispose().await;
                }
                return Err(ListenerError::Bind {
                    address: endpoint.to_string(),
                    source,
                });
            }
        };
        let local_addr = socket.local_addr().map_err(|source| ListenerError::Bind {
            address: endpoint.to_string(),
            source,
        })?;

        tracing::info!(
            address = %local_addr,
            workers = workers.len(),
            policy = ?self.policy,
            "Delegating listener bound"
        );

        Ok(DelegatingListener {
            socket: ArcSwapOption::from_pointee(socket),
            local_addr,
            workers,
            policy: self.policy.clone(),
            connections: ConnectionFactory::new(),
            accepted: AtomicU64::new(0),
            unbound: CancellationToken::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::LocalOnly;
    use tokio::net::TcpStream;

    fn no_workers() -> WorkerPoolConfig {
        WorkerPoolConfig {
            count: 0,
            ..WorkerPoolConfig::default()
        }
    }

    #[derive(Debug)]
    struct Always(usize);

    impl RoutingPolicy for Always {
        fn route(&self, _ordinal: u64, _workers: usize) -> Route {
            Route::Worker(self.0)
        }
    }

    async fn bind(policy: Arc<dyn RoutingPolicy>) -> DelegatingListener {
        DelegatingListenerFactory::new(no_workers(), policy)
            .bind("127.0.0.1:0".parse().unwrap(), &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn local_connections_are_returned() {
        let listener = bind(Arc::new(LocalOnly)).await;
        let addr = listener.local_addr();
        let client = TcpStream::connect(addr).await.unwrap();

        let connection = listener
            .accept(&CancellationToken::new())
            .await
            .unwrap()
            .expect("connection");
        assert_eq!(connection.origin(), Origin::Local);
        assert_eq!(connection.peer_addr(), client.local_addr().unwrap());
        assert_eq!(listener.accepted_count(), 1);
    }

    #[tokio::test]
    async fn missing_worker_falls_back_to_local() {
        let listener = bind(Arc::new(Always(3))).await;
        let _client = TcpStream::connect(listener.local_addr()).await.unwrap();

        let connection = listener.accept(&CancellationToken::new()).await.unwrap();
        assert!(connection.is_some());
    }

    #[tokio::test]
    async fn unbind_ends_the_stream() {
        let listener = Arc::new(bind(Arc::new(LocalOnly)).await);
        let accepting = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept(&CancellationToken::new()).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        listener.unbind().await;

        assert!(accepting.await.unwrap().unwrap().is_none());
        assert!(listener.accept(&CancellationToken::new()).await.unwrap().is_none());
        assert!(TcpStream::connect(listener.local_addr()).await.is_err());
    }

    #[tokio::test]
    async fn cancelled_accept_reports_cancellation() {
        let listener = bind(Arc::new(LocalOnly)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            listener.accept(&cancel).await,
            Err(ListenerError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn missing_worker_program_fails_bind() {
        let config = WorkerPoolConfig {
            program: "/nonexistent/handoff-worker".into(),
            count: 1,
            ..WorkerPoolConfig::default()
        };
        let result = DelegatingListenerFactory::new(config, Arc::new(LocalOnly))
            .bind("127.0.0.1:0".parse().unwrap(), &CancellationToken::new())
            .await;

        match result {
            Err(ListenerError::Start { worker: 0, source: StartError::Spawn(_) }) => {}
            Err(other) => panic!("expected a spawn failure for worker 0, got {other}"),
            Ok(_) => panic!("bind succeeded without a worker"),
        }
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let result = DelegatingListenerFactory::new(no_workers(), Arc::new(LocalOnly))
            .bind(taken.local_addr().unwrap(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ListenerError::Bind { .. })));
    }
}
