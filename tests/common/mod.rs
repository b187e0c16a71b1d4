//! Shared utilities for integration tests.

use std::net::SocketAddr;
use std::time::Duration;

use socket_handoff::config::WorkerPoolConfig;
use socket_handoff::routing::{Route, RoutingPolicy};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Routes every connection to one worker.
#[derive(Debug)]
pub struct Always(pub usize);

impl RoutingPolicy for Always {
    fn route(&self, _ordinal: u64, _workers: usize) -> Route {
        Route::Worker(self.0)
    }
}

/// Pool running the real worker binary built alongside these tests.
pub fn worker_pool(count: usize) -> WorkerPoolConfig {
    WorkerPoolConfig {
        program: env!("CARGO_BIN_EXE_handoff-worker").into(),
        count,
        connect_retry_ms: 100,
        ..WorkerPoolConfig::default()
    }
}

/// Issue `GET /` and return the raw response.
pub async fn http_get(addr: SocketAddr) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await?;

    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_string(&mut response))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "no response"))??;
    Ok(response)
}

/// Whether a process with this pid still exists.
#[allow(dead_code)]
pub fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}
