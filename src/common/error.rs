//! Error types for meshipam

use std::net::Ipv4Addr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Store Errors ===
    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("etcd error: {0}")]
    Store(#[from] etcd_client::Error),

    #[error("Watch stream error on {key}: {reason}")]
    WatchStream { key: String, reason: String },

    #[error("Conflicting concurrent update on {key} after {attempts} attempts")]
    Conflict { key: String, attempts: usize },

    // === Allocation Errors ===
    #[error("Subnet pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("All addresses in range {start}-{end} are used")]
    AddressRangeExhausted { start: String, end: String },

    #[error("No free address left in subnet {0}")]
    SubnetExhausted(String),

    #[error("No subnet assigned to host {0}")]
    SubnetNotAssigned(String),

    #[error("Invalid subnet: {0}")]
    InvalidSubnet(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // === Watcher Errors ===
    #[error("Another instance is already running (pid {0})")]
    AlreadyRunning(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node inventory error: {0}")]
    Inventory(#[from] reqwest::Error),

    #[error("Fast-path table error: {0}")]
    FastPath(String),

    // === Encoding Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Is this a transient error worth retrying?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_)
                | Error::Store(_)
                | Error::WatchStream { .. }
                | Error::Conflict { .. }
        )
    }

    pub fn invalid_address(addr: impl std::fmt::Display) -> Self {
        Error::InvalidAddress(addr.to_string())
    }

    pub(crate) fn range_exhausted(start: Ipv4Addr, end: Ipv4Addr) -> Self {
        Error::AddressRangeExhausted {
            start: start.to_string(),
            end: end.to_string(),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::Io(std::io::Error::from(e))
    }
}

impl From<ipnet::PrefixLenError> for Error {
    fn from(e: ipnet::PrefixLenError) -> Self {
        Error::InvalidSubnet(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Error::StoreUnavailable("down".into()).is_retryable());
        assert!(Error::Conflict {
            key: "/a".into(),
            attempts: 3
        }
        .is_retryable());
        assert!(!Error::PoolExhausted("10.244.0.0/16".into()).is_retryable());
        assert!(!Error::SubnetNotAssigned("node-a".into()).is_retryable());
    }

    #[test]
    fn test_range_exhausted_message() {
        let e = Error::range_exhausted(Ipv4Addr::new(10, 0, 0, 10), Ipv4Addr::new(10, 0, 0, 20));
        assert_eq!(e.to_string(), "All addresses in range 10.0.0.10-10.0.0.20 are used");
    }
}
