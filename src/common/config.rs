//! Configuration for meshipam components
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `MESHIPAM__`-prefixed environment variables (e.g. `MESHIPAM__IPAM__SUBNET`).

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Coordination store connection
    pub store: StoreConfig,

    /// Address management parameters
    pub ipam: IpamConfig,

    /// Propagation watcher settings
    pub watcher: WatcherConfig,

    /// Node inventory lookup
    pub inventory: InventoryConfig,

    /// Logging level (overridden by RUST_LOG)
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            ipam: IpamConfig::default(),
            watcher: WatcherConfig::default(),
            inventory: InventoryConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

/// etcd connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store endpoints
    pub endpoints: Vec<String>,

    /// CA bundle used to verify the store
    pub ca_cert: Option<PathBuf>,

    /// Client certificate (PEM)
    pub cert: Option<PathBuf>,

    /// Client private key (PEM)
    pub key: Option<PathBuf>,

    /// Dial timeout
    pub connect_timeout_ms: u64,

    /// Key namespace every record lives under
    pub namespace: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["https://127.0.0.1:2379".to_string()],
            ca_cert: None,
            cert: None,
            key: None,
            connect_timeout_ms: 30_000,
            namespace: "meshipam/ipam".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// IPAM parameters shared by every host of a cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpamConfig {
    /// Cluster subnet, optionally with an embedded `/mask`
    pub subnet: String,

    /// Cluster mask length (ignored when `subnet` embeds one)
    pub mask_len: u8,

    /// Prefix length of each host's pod subnet (defaults to `mask_len`)
    pub pod_mask_len: Option<u8>,

    /// Optional first address handed out on this host
    pub range_start: Option<Ipv4Addr>,

    /// Optional last address handed out on this host
    pub range_end: Option<Ipv4Addr>,

    /// Attempts before a contended compare-and-swap gives up
    pub cas_retries: usize,

    /// Hostname override (defaults to the system hostname)
    pub hostname: Option<String>,
}

impl Default for IpamConfig {
    fn default() -> Self {
        Self {
            subnet: "10.244.0.0/16".to_string(),
            mask_len: 24,
            pod_mask_len: None,
            range_start: None,
            range_end: None,
            cas_retries: 16,
            hostname: None,
        }
    }
}

/// Propagation watcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Advisory lock file guarding against a second watcher on the host
    pub lock_path: PathBuf,

    /// Health/status endpoint (disabled when unset)
    pub health_addr: Option<SocketAddr>,

    /// First reconnect delay after a watch stream ends
    pub backoff_initial_ms: u64,

    /// Reconnect delay ceiling
    pub backoff_max_ms: u64,

    /// JSON mirror of the fast-path table, read by the datapath loader
    pub snapshot_path: Option<PathBuf>,

    /// Capacity of the event channel shared by all watches
    pub event_buffer: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            lock_path: PathBuf::from("/run/meshipam/watcher.lock"),
            health_addr: Some(SocketAddr::from(([127, 0, 0, 1], 3190))),
            backoff_initial_ms: 100,
            backoff_max_ms: 30_000,
            snapshot_path: None,
            event_buffer: 256,
        }
    }
}

impl WatcherConfig {
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Node inventory settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    /// Kubernetes API server, e.g. `https://10.0.0.1:6443`
    pub api_server: Option<String>,

    pub ca_cert: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,

    /// Fixed hostname -> internal IP entries, consulted before the API server
    pub static_nodes: HashMap<String, Ipv4Addr>,
}

impl Config {
    /// Load configuration from an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let built = builder
            .add_source(
                config::Environment::with_prefix("MESHIPAM")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("store.endpoints")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = built.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that can never work.
    pub fn validate(&self) -> Result<()> {
        if self.store.endpoints.is_empty() {
            return Err(Error::InvalidConfig("store.endpoints is empty".into()));
        }
        if self.store.cert.is_some() != self.store.key.is_some() {
            return Err(Error::InvalidConfig(
                "store.cert and store.key must be set together".into(),
            ));
        }
        if self.store.namespace.trim_matches('/').is_empty() {
            return Err(Error::InvalidConfig("store.namespace is empty".into()));
        }
        if self.ipam.mask_len > 32 || self.ipam.pod_mask_len.is_some_and(|m| m > 32) {
            return Err(Error::InvalidConfig("mask length must be <= 32".into()));
        }
        if self.ipam.range_start.is_some() != self.ipam.range_end.is_some() {
            return Err(Error::InvalidConfig(
                "ipam.range_start and ipam.range_end must be set together".into(),
            ));
        }
        if self.ipam.cas_retries == 0 {
            return Err(Error::InvalidConfig("ipam.cas_retries must be > 0".into()));
        }
        if self.watcher.backoff_initial_ms == 0
            || self.watcher.backoff_initial_ms > self.watcher.backoff_max_ms
        {
            return Err(Error::InvalidConfig(
                "watcher backoff must satisfy 0 < initial <= max".into(),
            ));
        }
        if self.watcher.event_buffer == 0 {
            return Err(Error::InvalidConfig("watcher.event_buffer must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.ipam.mask_len, 24);
        assert_eq!(config.store.namespace, "meshipam/ipam");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"

[store]
endpoints = ["https://10.0.0.5:2379", "https://10.0.0.6:2379"]

[ipam]
subnet = "192.168.64.0/24"
range_start = "192.168.64.10"
range_end = "192.168.64.20"

[inventory.static_nodes]
node-b = "10.0.0.12"
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.store.endpoints.len(), 2);
        assert_eq!(config.ipam.subnet, "192.168.64.0/24");
        assert_eq!(config.ipam.range_start, Some(Ipv4Addr::new(192, 168, 64, 10)));
        assert_eq!(
            config.inventory.static_nodes.get("node-b"),
            Some(&Ipv4Addr::new(10, 0, 0, 12))
        );
        assert_eq!(config.log_level, "debug");
        // untouched sections keep their defaults
        assert_eq!(config.watcher.backoff_max_ms, 30_000);
    }

    #[test]
    fn test_half_range_rejected() {
        let mut config = Config::default();
        config.ipam.range_start = Some(Ipv4Addr::new(10, 244, 0, 10));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_bounds_rejected() {
        let mut config = Config::default();
        config.watcher.backoff_initial_ms = 60_000;
        assert!(config.validate().is_err());
    }
}
