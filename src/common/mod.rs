//! Common utilities and types shared across meshipam

pub mod config;
pub mod error;
pub mod utils;

pub use config::{Config, InventoryConfig, IpamConfig, StoreConfig, WatcherConfig};
pub use error::{Error, Result};
pub use utils::{address_range, join_list, local_hostname, parse_addresses, split_list, Backoff};
