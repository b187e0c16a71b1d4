//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Front process:
//!     public socket → delegating listener → routing decision
//!         → local: connection.rs wraps it → application accept()
//!         → remote: handed to a worker, never seen again here
//!
//! Worker process:
//!     control port → delegated listener → backlog
//!         → connection.rs wraps it → application accept()
//!
//! Listener States:
//!     Bound → Accepting → Unbound
//! ```

pub mod connection;
pub mod listener;

pub use connection::{Connection, ConnectionFactory, ConnectionId, Origin};
pub use listener::{ConnectionListener, ListenerError, ListenerFactory};
