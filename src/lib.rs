//! # meshipam
//!
//! Decentralized container IP address management over etcd:
//! - One subnet per host, claimed from a cluster-wide pool
//! - Addresses handed out per host subnet, reserved before use
//! - Compare-and-swap transactions for every shared-state mutation
//! - A per-host watcher mirroring remote addresses into the local fast path
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!            ┌──────────────────────────────────┐
//!            │              etcd                │
//!            │  pool · host → subnet · records  │
//!            │  maps {subnet: host}             │
//!            └───────┬───────────────▲──────────┘
//!        CAS txns    │               │ watch streams
//!   ┌────────────────▼───┐      ┌────┴────────────────────┐
//!   │ IpamService        │      │ Propagator              │
//!   │  SubnetPool        │      │  bootstrap + per-key    │
//!   │  AddressAllocator  │      │  watches → apply loop   │
//!   └────────────────────┘      └────┬────────────────────┘
//!      (plugin / CLI)                │ diff
//!                               ┌────▼─────────────┐
//!                               │ FastPathTable    │
//!                               │ addr → host IP   │
//!                               └──────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Allocate an address on this host
//! ```bash
//! meshipam --config /etc/meshipam/meshipam.toml allocate
//! meshipam release 10.244.5.17
//! ```
//!
//! ### Run the watcher (under the host's supervisor)
//! ```bash
//! meshipam-watcher --config /etc/meshipam/meshipam.toml
//! ```
//!
//! ### Library
//! ```no_run
//! # async fn demo() -> meshipam::Result<()> {
//! use meshipam::{Config, EtcdStore, IpamOptions, IpamService};
//! use std::sync::Arc;
//!
//! let config = Config::load(None)?;
//! let store = Arc::new(EtcdStore::connect(&config.store).await?);
//! let ipam = IpamService::init(store, "node-a", IpamOptions::from_config(&config)).await?;
//! let addr = ipam.get().await.unused_ip().await?;
//! # let _ = addr;
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod inventory;
pub mod ipam;
pub mod store;
pub mod watcher;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use ipam::{IpamOptions, IpamService};
pub use store::{CoordinationStore, EtcdStore, MemoryStore};
pub use watcher::{Propagator, WatcherDaemon};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
