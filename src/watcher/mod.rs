//! Change propagation watcher
//!
//! Long-running per-host service that keeps the local fast-path table in sync
//! with the address records of every other host.

pub mod fastpath;
pub mod guard;
pub mod health;
pub mod propagator;
pub mod server;

pub use fastpath::{FastPathTable, MemoryFastPath};
pub use guard::InstanceGuard;
pub use propagator::{Propagator, PropagatorState};
pub use server::WatcherDaemon;
