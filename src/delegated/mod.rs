//! Worker side of the handoff.
//!
//! # Data Flow
//! ```text
//! control port accept
//!     → one forwarding task per control connection
//!         → frames() → Reconstructor → Connection → backlog
//! accept()
//!     → backlog pop (blocks until an item or unbind)
//! ```

pub mod listener;

pub use listener::{DelegatedListener, DelegatedListenerFactory};
