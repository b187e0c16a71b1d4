//! Worker-side listener fed by the front process.
//!
//! # Responsibilities
//! - Accept control connections on the loopback port
//! - Read token frames, rebuild each socket, queue it in the backlog
//! - Serve `accept()` from the backlog
//!
//! # Design Decisions
//! - Each control connection gets its own forwarding task; a closed or
//!   broken control connection never stops the accept loop
//! - A token that cannot be redeemed costs that one connection only
//! - Forwarding blocks while the backlog is full, which pushes back on the
//!   front process through the control channel
//! - Dispose cancels the accept loop, closes the backlog to release any
//!   blocked forwarder, then waits for every task to finish

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::handoff::{self, BacklogReader, BacklogWriter, Reconstructor, DEFAULT_BACKLOG};
use crate::net::{Connection, ConnectionFactory, ConnectionListener, ListenerError, ListenerFactory, Origin};
use crate::observability::metrics;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Yields connections handed over by the front process.
pub struct DelegatedListener {
    local_addr: SocketAddr,
    backlog: BacklogReader<Connection>,
    shutdown: CancellationToken,
    connections: ConnectionFactory,
    accept_loop: Mutex<Option<JoinHandle<()>>>,
}

impl DelegatedListener {
    /// Connections rebuilt and not yet dropped, queued ones included.
    pub fn active_count(&self) -> u64 {
        self.connections.active_count()
    }
}

#[async_trait]
impl ConnectionListener for DelegatedListener {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept(&self, cancel: &CancellationToken) -> Result<Option<Connection>, ListenerError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ListenerError::Cancelled),
            connection = self.backlog.pop() => Ok(connection),
        }
    }

    async fn unbind(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!(address = %self.local_addr, "Delegated listener unbound");
        }
        self.shutdown.cancel();
        self.backlog.close().await;
    }

    async fn dispose(&self) {
        self.unbind().await;
        self.connections.dispose();
        if let Some(accept_loop) = self.accept_loop.lock().await.take() {
            if let Err(e) = accept_loop.await {
                tracing::error!(error = %e, "Control accept loop panicked");
            }
        }
    }
}

async fn accept_control_connections(
    socket: TcpListener,
    reconstructor: Arc<dyn Reconstructor>,
    backlog: BacklogWriter<Connection>,
    connections: ConnectionFactory,
    shutdown: CancellationToken,
) {
    let mut forwarders = JoinSet::new();

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(finished) = forwarders.join_next(), if !forwarders.is_empty() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        tracing::error!(error = %e, "Forwarding task panicked");
                    }
                }
                continue;
            }
            accepted = socket.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                tracing::info!(peer_addr = %peer_addr, "Control channel accepted");
                forwarders.spawn(forward_handoffs(
                    stream,
                    peer_addr,
                    reconstructor.clone(),
                    backlog.clone(),
                    connections.clone(),
                ));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Control accept failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                }
            }
        }
    }

    drop(socket);
    forwarders.shutdown().await;
    tracing::debug!("Control accept loop stopped");
}

async fn forward_handoffs(
    stream: TcpStream,
    peer_addr: SocketAddr,
    reconstructor: Arc<dyn Reconstructor>,
    backlog: BacklogWriter<Connection>,
    connections: ConnectionFactory,
) {
    let mut frames = handoff::frames(stream);

    while let Some(frame) = frames.next().await {
        let token = match frame {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(peer_addr = %peer_addr, error = %e, "Control channel read failed");
                break;
            }
        };

        let socket = match reconstructor.reconstruct(&token).await {
            Ok(socket) => socket,
            Err(e) => {
                metrics::record_reconstruct_failure();
                tracing::warn!(?token, error = %e, "Dropping handoff");
                continue;
            }
        };

        let connection = match connections.create_from_std(socket, Origin::Delegated) {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping reconstructed socket");
                continue;
            }
        };
        metrics::record_received();
        tracing::debug!(
            connection_id = %connection.id(),
            peer_addr = %connection.peer_addr(),
            "Connection received"
        );

        if backlog.push(connection).await.is_err() {
            tracing::debug!("Backlog closed, dropping connection");
            break;
        }
    }

    tracing::info!(peer_addr = %peer_addr, "Control channel closed");
}

/// Binds the worker's control port.
pub struct DelegatedListenerFactory {
    reconstructor: Arc<dyn Reconstructor>,
    backlog: usize,
}

impl DelegatedListenerFactory {
    pub fn new(reconstructor: Arc<dyn Reconstructor>) -> Self {
        Self {
            reconstructor,
            backlog: DEFAULT_BACKLOG,
        }
    }

    pub fn with_backlog(mut self, backlog: usize) -> Self {
        self.backlog = backlog;
        self
    }
}

#[async_trait]
impl ListenerFactory for DelegatedListenerFactory {
    type Listener = DelegatedListener;

    async fn bind(
        &self,
        endpoint: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<DelegatedListener, ListenerError> {
        let bound = tokio::select! {
            _ = cancel.cancelled() => return Err(ListenerError::Cancelled),
            bound = TcpListener::bind(endpoint) => bound,
        };
        let bind_error = |source| ListenerError::Bind {
            address: endpoint.to_string(),
            source,
        };
        let socket = bound.map_err(bind_error)?;
        let local_addr = socket.local_addr().map_err(bind_error)?;

        let (writer, reader) = handoff::bounded(self.backlog);
        let shutdown = CancellationToken::new();
        let connections = ConnectionFactory::new();

        let accept_loop = tokio::spawn(accept_control_connections(
            socket,
            self.reconstructor.clone(),
            writer,
            connections.clone(),
            shutdown.clone(),
        ));

        tracing::info!(address = %local_addr, backlog = self.backlog, "Delegated listener bound");

        Ok(DelegatedListener {
            local_addr,
            backlog: reader,
            shutdown,
            connections,
            accept_loop: Mutex::new(Some(accept_loop)),
        })
    }
}
