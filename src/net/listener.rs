//! The connection listener contract shared by both sides of a handoff.
//!
//! # Responsibilities
//! - `bind` an endpoint and produce a listener
//! - `accept` connections until end-of-stream
//! - `unbind` to stop accepting, `dispose` to release everything
//!
//! # Design Decisions
//! - `accept` returns `Ok(None)` for end-of-stream; after that it never
//!   produces another connection
//! - Closing the underlying socket is a clean end, never an error
//! - Every suspension point honors the caller's cancellation token

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::delegating::StartError;
use crate::net::connection::Connection;

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// A worker could not be brought up during bind.
    #[error("failed to start worker {worker}: {source}")]
    Start {
        worker: usize,
        #[source]
        source: StartError,
    },

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
}

/// A source of accepted connections.
#[async_trait]
pub trait ConnectionListener: Send + Sync {
    /// Address the listener was bound to.
    fn local_addr(&self) -> SocketAddr;

    /// Wait for the next connection.
    ///
    /// `Ok(None)` is end-of-stream.
    async fn accept(&self, cancel: &CancellationToken) -> Result<Option<Connection>, ListenerError>;

    /// Stop accepting new connections.
    async fn unbind(&self);

    /// Unbind and release every resource the listener owns.
    async fn dispose(&self);
}

/// Binds listeners for an endpoint.
#[async_trait]
pub trait ListenerFactory: Send + Sync {
    type Listener: ConnectionListener;

    async fn bind(
        &self,
        endpoint: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<Self::Listener, ListenerError>;
}
