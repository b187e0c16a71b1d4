//! HTTP server setup over a connection listener.
//!
//! # Responsibilities
//! - Create the Axum Router
//! - Adapt any [`ConnectionListener`] into an `axum::serve` listener
//! - Serve until the shutdown token fires
//!
//! # Design Decisions
//! - The application never sees whether a connection was accepted locally
//!   or handed over by the front process
//! - End-of-stream from the listener parks the accept side; graceful
//!   shutdown is what ends `serve`

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{connect_info::Connected, ConnectInfo},
    routing::get,
    serve::IncomingStream,
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::net::{Connection, ConnectionListener};

/// [`axum::serve::Listener`] over a [`ConnectionListener`].
pub struct ListenerStream {
    listener: Arc<dyn ConnectionListener>,
    cancel: CancellationToken,
}

impl ListenerStream {
    pub fn new(listener: Arc<dyn ConnectionListener>, cancel: CancellationToken) -> Self {
        Self { listener, cancel }
    }
}

impl axum::serve::Listener for ListenerStream {
    type Io = Connection;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.listener.accept(&self.cancel).await {
            Ok(Some(connection)) => {
                let peer_addr = connection.peer_addr();
                (connection, peer_addr)
            }
            Ok(None) => {
                tracing::debug!("Listener exhausted, waiting for shutdown");
                std::future::pending().await
            }
            Err(e) => {
                tracing::debug!(error = %e, "Listener stopped, waiting for shutdown");
                std::future::pending().await
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.listener.local_addr())
    }
}

/// Client address of a connection served through a [`ListenerStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

impl Connected<IncomingStream<'_, ListenerStream>> for PeerAddr {
    fn connect_info(stream: IncomingStream<'_, ListenerStream>) -> Self {
        Self(*stream.remote_addr())
    }
}

/// HTTP server for the front and worker processes.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new() -> Self {
        Self {
            router: Self::build_router(),
        }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router() -> Router {
        Router::new()
            .route("/", get(whoami))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve connections from `listener` until `shutdown` fires.
    pub async fn run(
        self,
        listener: Arc<dyn ConnectionListener>,
        shutdown: CancellationToken,
    ) -> Result<(), std::io::Error> {
        tracing::info!(address = %listener.local_addr(), "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<PeerAddr>();
        let stream = ListenerStream::new(listener, shutdown.clone());

        axum::serve(stream, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

impl Default for HttpServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn whoami(ConnectInfo(PeerAddr(peer_addr)): ConnectInfo<PeerAddr>) -> String {
    let pid = std::process::id();
    tracing::debug!(peer_addr = %peer_addr, pid, "Serving request");
    format!("From {pid}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{ConnectionFactory, ListenerError, Origin};
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    struct PlainListener {
        socket: TcpListener,
        connections: ConnectionFactory,
    }

    #[async_trait]
    impl ConnectionListener for PlainListener {
        fn local_addr(&self) -> SocketAddr {
            self.socket.local_addr().unwrap()
        }

        async fn accept(&self, cancel: &CancellationToken) -> Result<Option<Connection>, ListenerError> {
            tokio::select! {
                _ = cancel.cancelled() => Err(ListenerError::Cancelled),
                accepted = self.socket.accept() => {
                    let (stream, _) = accepted.unwrap();
                    Ok(Some(self.connections.create(stream, Origin::Local).unwrap()))
                }
            }
        }

        async fn unbind(&self) {}

        async fn dispose(&self) {}
    }

    async fn fetch_root(addr: SocketAddr) -> (String, SocketAddr) {
        let mut client = TcpStream::connect(addr).await.unwrap();
        let client_addr = client.local_addr().unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        (response, client_addr)
    }

    fn plain_listener(socket: TcpListener) -> Arc<PlainListener> {
        Arc::new(PlainListener {
            socket,
            connections: ConnectionFactory::new(),
        })
    }

    #[tokio::test]
    async fn handlers_see_the_client_address() {
        let listener = plain_listener(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.local_addr();
        let shutdown = CancellationToken::new();

        let app = Router::new()
            .route(
                "/",
                get(|ConnectInfo(PeerAddr(peer)): ConnectInfo<PeerAddr>| async move { peer.to_string() }),
            )
            .into_make_service_with_connect_info::<PeerAddr>();
        let stream = ListenerStream::new(listener, shutdown.clone());
        let server = tokio::spawn(async move {
            axum::serve(stream, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        });

        let (response, client_addr) = fetch_root(addr).await;
        assert!(response.ends_with(&client_addr.to_string()), "{response}");
        server.abort();
    }

    #[tokio::test]
    async fn root_answers_with_process_id() {
        let listener = plain_listener(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.local_addr();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(HttpServer::new().run(listener, shutdown.clone()));

        let (response, _) = fetch_root(addr).await;

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with(&format!("From {}", std::process::id())));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
