//! Bounded backlog of reconstructed connections awaiting `accept()`.
//!
//! # Responsibilities
//! - Preserve arrival order across producers
//! - Apply backpressure: producers wait while the backlog is full
//! - Unblock every waiter, producer or consumer, when closed

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Default backlog depth for a delegated listener.
pub const DEFAULT_BACKLOG: usize = 20;

/// Returned by [`BacklogWriter::push`] once the backlog is closed.
///
/// Carries the rejected item back so the caller can drop it deliberately.
#[derive(Debug)]
pub struct BacklogClosed<T>(pub T);

impl<T> std::fmt::Display for BacklogClosed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "backlog closed")
    }
}

impl<T: std::fmt::Debug> std::error::Error for BacklogClosed<T> {}

/// Create a backlog holding at most `capacity` items.
pub fn bounded<T>(capacity: usize) -> (BacklogWriter<T>, BacklogReader<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let closed = CancellationToken::new();
    (
        BacklogWriter {
            tx,
            closed: closed.clone(),
        },
        BacklogReader {
            rx: Mutex::new(rx),
            closed,
        },
    )
}

/// Producer half. Cheap to clone, one per forwarding task.
#[derive(Debug)]
pub struct BacklogWriter<T> {
    tx: mpsc::Sender<T>,
    closed: CancellationToken,
}

impl<T> Clone for BacklogWriter<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<T> BacklogWriter<T> {
    /// Push an item, waiting while the backlog is full.
    pub async fn push(&self, item: T) -> Result<(), BacklogClosed<T>> {
        if self.closed.is_cancelled() {
            return Err(BacklogClosed(item));
        }
        let permit = tokio::select! {
            _ = self.closed.cancelled() => return Err(BacklogClosed(item)),
            permit = self.tx.reserve() => permit,
        };
        match permit {
            Ok(permit) => {
                permit.send(item);
                Ok(())
            }
            Err(_) => Err(BacklogClosed(item)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Consumer half, owned by the listener.
#[derive(Debug)]
pub struct BacklogReader<T> {
    rx: Mutex<mpsc::Receiver<T>>,
    closed: CancellationToken,
}

impl<T> BacklogReader<T> {
    /// Take the oldest item, waiting until one arrives.
    ///
    /// Returns `None` once the backlog is closed.
    pub async fn pop(&self) -> Option<T> {
        if self.closed.is_cancelled() {
            return None;
        }
        let mut rx = tokio::select! {
            _ = self.closed.cancelled() => return None,
            rx = self.rx.lock() => rx,
        };
        tokio::select! {
            _ = self.closed.cancelled() => None,
            item = rx.recv() => item,
        }
    }

    /// Close the backlog. Blocked producers fail, blocked consumers get `None`,
    /// and anything still queued is dropped.
    pub async fn close(&self) {
        self.closed.cancel();
        let mut rx = self.rx.lock().await;
        rx.close();
        while rx.try_recv().is_ok() {}
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
