//! Front side of the handoff.
//!
//! # Data Flow
//! ```text
//! bind():
//!     for each worker: pick port → spawn → connect control channel (retry)
//!     → bind public endpoint
//!
//! accept():
//!     TcpListener::accept → RoutingPolicy
//!         → Local      → Connection returned to the caller
//!         → Worker(i)  → duplicate → frame → worker i, keep accepting
//! ```

pub mod listener;
pub mod spawner;
pub mod supervisor;

pub use listener::{DelegatingListener, DelegatingListenerFactory};
pub use spawner::{ProcessSpawner, SpawnError, WorkerLaunch, WorkerSpawner};
pub use supervisor::{ForwardError, StartError, WorkerSupervisor};
