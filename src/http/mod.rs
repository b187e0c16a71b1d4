//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! ConnectionListener::accept (local or delegated connection)
//!     → server.rs (ListenerStream adapts it for axum::serve)
//!     → Router ("GET /" answers with the serving process id)
//!     → Send to client
//! ```

pub mod server;

pub use server::{HttpServer, ListenerStream, PeerAddr};
