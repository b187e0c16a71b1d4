//! Cross-process TCP connection handoff.
//!
//! A front process accepts connections on a public endpoint and, per a
//! routing policy, either serves them itself or hands the live socket to a
//! worker process it launched. Workers see handed-over connections through
//! the same listener interface as locally accepted ones.

#[cfg(not(unix))]
compile_error!("socket-handoff needs unix descriptor passing");

pub mod config;
pub mod delegated;
pub mod delegating;
pub mod handoff;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod routing;

pub use config::schema::HandoffConfig;
pub use delegated::{DelegatedListener, DelegatedListenerFactory};
pub use delegating::{DelegatingListener, DelegatingListenerFactory};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use net::{Connection, ConnectionListener, ListenerFactory};
