//! Cross-process connection handoff primitives.
//!
//! # Data Flow
//! ```text
//! Front process (sender)                       Worker process (receiver)
//!     accepted TcpStream
//!     → Duplicator (descriptor channel, SCM_RIGHTS)  ──▶  DescriptorReceiver
//!     → DuplicationToken                                   ▲
//!     → codec.rs (u16 LE length + token)  ── control ──▶  codec.rs (frames)
//!                                                          → Reconstructor
//!                                                          → backlog.rs
//!                                                          → accept()
//! ```
//!
//! # Design Decisions
//! - The wire frame is platform-neutral; only the token layout and the
//!   duplicate/reconstruct calls are platform-specific
//! - A token is consumed exactly once; reuse is detected and rejected
//! - The backlog is the only structure shared between tasks

pub mod backlog;
pub mod codec;
pub mod token;

#[cfg(unix)]
pub mod unix;

use async_trait::async_trait;

pub use backlog::{bounded, BacklogClosed, BacklogReader, BacklogWriter, DEFAULT_BACKLOG};
pub use codec::{encode_frame, frames, FrameCodec, MAX_FRAME_PAYLOAD};
pub use token::DuplicationToken;

/// Errors produced while duplicating or reconstructing a socket.
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    /// The token does not have the layout this platform expects.
    #[error("malformed duplication token ({len} bytes)")]
    Malformed { len: usize },

    /// The token was issued for a different process.
    #[error("token issued for process {expected}, reconstructed in {actual}")]
    WrongProcess { expected: u32, actual: u32 },

    /// The token was already used to reconstruct a socket.
    #[error("token {sequence} already consumed")]
    AlreadyConsumed { sequence: u64 },

    /// No descriptor was delivered for this token.
    #[error("no descriptor delivered for token {sequence}")]
    Unknown { sequence: u64 },

    /// The descriptor channel failed or closed.
    #[error("descriptor channel: {0}")]
    Channel(#[from] std::io::Error),
}

/// Turns a live local socket into a token another process can reconstruct.
///
/// The socket is closed in the calling process once the token is produced;
/// ownership moves to the target process.
#[async_trait]
pub trait Duplicator: Send + Sync {
    async fn duplicate_and_close(
        &self,
        socket: std::net::TcpStream,
    ) -> Result<DuplicationToken, HandoffError>;
}

/// Rebuilds a live socket from a token produced by a [`Duplicator`].
#[async_trait]
pub trait Reconstructor: Send + Sync {
    async fn reconstruct(
        &self,
        token: &DuplicationToken,
    ) -> Result<std::net::TcpStream, HandoffError>;
}
