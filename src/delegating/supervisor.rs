//! Supervision of one worker process and its control channel.
//!
//! # Responsibilities
//! - Pick a control port and launch the worker with it
//! - Connect to the worker's control port, retrying until it listens
//! - Forward accepted sockets: duplicate, then write the token as one frame
//! - Kill the worker on dispose
//!
//! # Design Decisions
//! - Connect attempts retry after a fixed delay with no upper bound; the
//!   caller's cancellation token is the only way to give up early
//! - A worker that exits while we are still connecting fails the start
//! - Forwarding serializes on the control channel lock so frames never
//!   interleave on the wire
//! - Any forwarding failure marks the worker disconnected; the delegating
//!   listener then stops routing to it

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use crate::config::{PortRange, WorkerPoolConfig};
use crate::delegating::spawner::{SpawnError, WorkerLaunch, WorkerSpawner};
use crate::handoff::unix::{channel_pair, DescriptorSender};
use crate::handoff::{Duplicator, FrameCodec, HandoffError};
use crate::observability::metrics;

/// Failure to bring a worker up.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("no control port available: {0}")]
    Port(#[source] io::Error),

    #[error("failed to set up descriptor channel: {0}")]
    Channel(#[source] io::Error),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("worker exited before its control port accepted ({0})")]
    Exited(ExitStatus),

    #[error("worker exited before reporting a process id")]
    NoPid,

    #[error("startup cancelled")]
    Cancelled,
}

/// Failure to forward one accepted socket.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("worker {0} is not connected")]
    NotConnected(usize),

    #[error("failed to detach socket from the runtime: {0}")]
    Detach(#[source] io::Error),

    #[error(transparent)]
    Duplicate(#[from] HandoffError),

    #[error("failed to write handoff frame: {0}")]
    Write(#[source] io::Error),
}

struct ControlChannel {
    writer: FramedWrite<TcpStream, FrameCodec>,
    descriptors: Box<dyn Duplicator>,
}

/// Owns one worker process from launch to kill.
pub struct WorkerSupervisor {
    index: usize,
    spawner: Arc<dyn WorkerSpawner>,
    port_range: Option<PortRange>,
    retry_delay: Duration,
    port: Option<u16>,
    pid: Option<u32>,
    child: Mutex<Option<Child>>,
    channel: Mutex<Option<ControlChannel>>,
    connected: AtomicBool,
}

impl WorkerSupervisor {
    pub fn new(index: usize, spawner: Arc<dyn WorkerSpawner>, config: &WorkerPoolConfig) -> Self {
        Self {
            index,
            spawner,
            port_range: config.port_range,
            retry_delay: config.connect_retry_delay(),
            port: None,
            pid: None,
            child: Mutex::new(None),
            channel: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Control port, once started.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Worker process id, once started.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Launch the worker and connect its control channel.
    ///
    /// Returns once the channel is connected. A no-op when already connected.
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<(), StartError> {
        if self.is_connected() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(StartError::Cancelled);
        }

        let port = select_port(self.port_range).map_err(StartError::Port)?;
        let (front_end, worker_end) = channel_pair().map_err(StartError::Channel)?;

        let mut child = self.spawner.spawn(WorkerLaunch {
            index: self.index,
            port,
            descriptor: worker_end,
        })?;

        let Some(pid) = child.id() else {
            return Err(StartError::NoPid);
        };
        tracing::info!(worker = self.index, pid, port, "Worker launched");

        let descriptors = match DescriptorSender::new(front_end, pid) {
            Ok(descriptors) => descriptors,
            Err(e) => {
                kill(&mut child, self.index).await;
                return Err(StartError::Channel(e));
            }
        };

        let stream = match connect_with_retry(&mut child, self.index, port, self.retry_delay, cancel).await {
            Ok(stream) => stream,
            Err(e) => {
                kill(&mut child, self.index).await;
                return Err(e);
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(worker = self.index, error = %e, "Failed to set TCP_NODELAY on control channel");
        }

        self.port = Some(port);
        self.pid = Some(pid);
        *self.child.get_mut() = Some(child);
        *self.channel.get_mut() = Some(ControlChannel {
            writer: FramedWrite::new(stream, FrameCodec::new()),
            descriptors: Box::new(descriptors),
        });
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    /// Hand `stream` to the worker.
    ///
    /// On success the local socket is closed. On failure the socket is
    /// dropped with the error; the connection is lost either way.
    pub async fn forward(&self, stream: TcpStream) -> Result<(), ForwardError> {
        let mut guard = self.channel.lock().await;
        let channel = match guard.as_mut() {
            Some(channel) if self.is_connected() => channel,
            _ => return Err(ForwardError::NotConnected(self.index)),
        };

        let socket = stream.into_std().map_err(ForwardError::Detach)?;

        let token = match channel.descriptors.duplicate_and_close(socket).await {
            Ok(token) => token,
            Err(e) => {
                self.connected.store(false, Ordering::Release);
                return Err(e.into());
            }
        };

        if let Err(e) = channel.writer.send(token).await {
            self.connected.store(false, Ordering::Release);
            return Err(ForwardError::Write(e));
        }
        Ok(())
    }

    /// Kill the worker and release its control channel.
    pub async fn dispose(&self) {
        self.connected.store(false, Ordering::Release);
        if let Some(mut child) = self.child.lock().await.take() {
            kill(&mut child, self.index).await;
        }
        self.channel.lock().await.take();
    }
}

impl std::fmt::Debug for WorkerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSupervisor")
            .field("index", &self.index)
            .field("pid", &self.pid)
            .field("port", &self.port)
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn select_port(range: Option<PortRange>) -> io::Result<u16> {
    match range {
        Some(range) if range.start >= range.end => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("port range {}..{} is empty", range.start, range.end),
        )),
        Some(range) => Ok(rand::thread_rng().gen_range(range.start..range.end)),
        None => {
            let probe = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
            Ok(probe.local_addr()?.port())
        }
    }
}

async fn connect_with_retry(
    child: &mut Child,
    worker: usize,
    port: u16,
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<TcpStream, StartError> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        metrics::record_connect_attempt(worker);

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(StartError::Cancelled),
            result = TcpStream::connect(addr) => result,
        };
        match result {
            Ok(stream) => {
                tracing::info!(worker, port, attempt, "Control channel connected");
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(worker, port, attempt, error = %e, "Worker not accepting yet");
            }
        }

        match child.try_wait() {
            Ok(Some(status)) => return Err(StartError::Exited(status)),
            Ok(None) => {}
            Err(e) => tracing::warn!(worker, error = %e, "Failed to poll worker status"),
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(StartError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn kill(child: &mut Child, worker: usize) {
    match child.kill().await {
        Ok(()) => tracing::info!(worker, "Worker stopped"),
        Err(e) => tracing::warn!(worker, error = %e, "Failed to kill worker"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[derive(Debug)]
    struct ShellSpawner(&'static str);

    impl WorkerSpawner for ShellSpawner {
        fn spawn(&self, launch: WorkerLaunch) -> Result<Child, SpawnError> {
            drop(launch.descriptor);
            Ok(tokio::process::Command::new("sh")
                .arg("-c")
                .arg(self.0)
                .kill_on_drop(true)
                .spawn()?)
        }
    }

    fn fast_retry() -> WorkerPoolConfig {
        WorkerPoolConfig {
            connect_retry_ms: 50,
            ..WorkerPoolConfig::default()
        }
    }

    #[test]
    fn port_is_drawn_from_configured_range() {
        for _ in 0..100 {
            let port = select_port(Some(PortRange { start: 40000, end: 40010 })).unwrap();
            assert!((40000..40010).contains(&port));
        }
    }

    #[test]
    fn empty_range_is_rejected() {
        let err = select_port(Some(PortRange { start: 9000, end: 9000 })).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(select_port(Some(PortRange { start: 9001, end: 9000 })).is_err());
    }

    #[tokio::test]
    async fn empty_range_fails_start() {
        let config = WorkerPoolConfig {
            port_range: Some(PortRange { start: 7000, end: 7000 }),
            ..fast_retry()
        };
        let mut worker = WorkerSupervisor::new(0, Arc::new(ShellSpawner("sleep 30")), &config);
        assert!(matches!(
            worker.start(&CancellationToken::new()).await,
            Err(StartError::Port(_))
        ));
    }

    #[test]
    fn ephemeral_port_is_nonzero() {
        assert_ne!(select_port(None).unwrap(), 0);
    }

    #[tokio::test]
    async fn worker_exiting_during_startup_fails_start() {
        let mut worker = WorkerSupervisor::new(0, Arc::new(ShellSpawner("exit 3")), &fast_retry());
        let err = worker.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, StartError::Exited(status) if status.code() == Some(3)));
        assert!(!worker.is_connected());
    }

    #[tokio::test]
    async fn cancelled_start_gives_up() {
        let mut worker = WorkerSupervisor::new(0, Arc::new(ShellSpawner("sleep 30")), &fast_retry());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let err = worker.start(&cancel).await.unwrap_err();
        assert!(matches!(err, StartError::Cancelled));
    }

    #[tokio::test]
    async fn forward_before_start_is_rejected() {
        let worker = WorkerSupervisor::new(5, Arc::new(ShellSpawner("true")), &fast_retry());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();

        assert!(matches!(
            worker.forward(stream).await,
            Err(ForwardError::NotConnected(5))
        ));
    }
}
