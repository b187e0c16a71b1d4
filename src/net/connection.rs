//! Accepted connections and their lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Wrap raw sockets into [`Connection`]s for the application
//! - Track live connections until the owning listener is disposed

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier, shown in logs as `conn-<n>`.
///
/// Ids are not carried across a handoff; the worker assigns its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// How a connection reached this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Accepted directly on this process's listening socket.
    Local,
    /// Reconstructed from a handoff by another process.
    Delegated,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Local => write!(f, "local"),
            Origin::Delegated => write!(f, "delegated"),
        }
    }
}

/// A connection ready for the application.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    origin: Origin,
    guard: ConnectionGuard,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.guard.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Give up tracking and take the raw stream.
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Creates [`Connection`]s for a listener and counts the live ones.
///
/// Disposed together with its listener; afterwards `create` refuses new sockets.
#[derive(Debug, Clone)]
pub struct ConnectionFactory {
    active_count: Arc<AtomicU64>,
    disposed: Arc<AtomicBool>,
}

impl ConnectionFactory {
    pub fn new() -> Self {
        Self {
            active_count: Arc::new(AtomicU64::new(0)),
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wrap an accepted or reconstructed socket.
    pub fn create(&self, stream: TcpStream, origin: Origin) -> io::Result<Connection> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection factory disposed",
            ));
        }

        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;

        self.active_count.fetch_add(1, Ordering::SeqCst);
        let guard = ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id: ConnectionId::next(),
        };

        tracing::trace!(
            connection_id = %guard.id,
            peer_addr = %peer_addr,
            %origin,
            "Connection created"
        );

        Ok(Connection {
            stream,
            peer_addr,
            local_addr,
            origin,
            guard,
        })
    }

    /// Wrap a socket rebuilt from a duplication token.
    pub fn create_from_std(&self, stream: std::net::TcpStream, origin: Origin) -> io::Result<Connection> {
        stream.set_nonblocking(true)?;
        self.create(TcpStream::from_std(stream)?, origin)
    }

    /// Get current live connection count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            tracing::debug!(
                active_connections = self.active_count(),
                "Connection factory disposed"
            );
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Default for ConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn accepted_stream() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[test]
    fn connection_ids_increase() {
        let first = ConnectionId::next();
        let second = ConnectionId::next();
        assert!(second > first);
        assert_eq!(format!("{first}"), format!("conn-{}", first.get()));
    }

    #[tokio::test]
    async fn factory_counts_live_connections() {
        let factory = ConnectionFactory::new();
        assert_eq!(factory.active_count(), 0);

        let (_c1, s1) = accepted_stream().await;
        let (_c2, s2) = accepted_stream().await;
        let conn1 = factory.create(s1, Origin::Local).unwrap();
        let conn2 = factory.create(s2, Origin::Delegated).unwrap();
        assert_eq!(factory.active_count(), 2);
        assert_ne!(conn1.id(), conn2.id());
        assert_eq!(conn2.origin(), Origin::Delegated);

        drop(conn1);
        assert_eq!(factory.active_count(), 1);

        drop(conn2);
        assert_eq!(factory.active_count(), 0);
    }

    #[tokio::test]
    async fn disposed_factory_rejects_sockets() {
        let factory = ConnectionFactory::new();
        factory.dispose();
        let (_client, server) = accepted_stream().await;
        assert!(factory.create(server, Origin::Local).is_err());
    }

    #[tokio::test]
    async fn connection_reads_and_writes_through() {
        let factory = ConnectionFactory::new();
        let (mut client, server) = accepted_stream().await;
        let mut conn = factory.create(server, Origin::Local).unwrap();
        assert_eq!(conn.peer_addr(), client.local_addr().unwrap());

        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        conn.write_all(b"yo").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"yo");
    }
}
