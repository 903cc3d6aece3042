//! Node inventory: hostname -> internal IP lookups
//!
//! The watcher needs the internal IP of every remote host so it can point
//! fast-path entries at it. Lookups go through [`NodeInventory`]; the static
//! variant answers from configuration, the Kubernetes one from the API server.

pub mod kube;

pub use kube::KubeInventory;

use crate::common::{Error, InventoryConfig, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

#[async_trait]
pub trait NodeInventory: Send + Sync {
    /// Internal IP of `hostname`, or `NodeNotFound`.
    async fn internal_ip(&self, hostname: &str) -> Result<Ipv4Addr>;
}

/// Fixed hostname -> IP table, optionally backed by another inventory for misses
#[derive(Default)]
pub struct StaticInventory {
    nodes: HashMap<String, Ipv4Addr>,
    fallback: Option<Arc<dyn NodeInventory>>,
}

impl StaticInventory {
    pub fn new(nodes: HashMap<String, Ipv4Addr>) -> Self {
        Self { nodes, fallback: None }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn NodeInventory>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn insert(&mut self, hostname: impl Into<String>, ip: Ipv4Addr) {
        self.nodes.insert(hostname.into(), ip);
    }
}

#[async_trait]
impl NodeInventory for StaticInventory {
    async fn internal_ip(&self, hostname: &str) -> Result<Ipv4Addr> {
        if let Some(ip) = self.nodes.get(hostname) {
            return Ok(*ip);
        }
        match &self.fallback {
            Some(fallback) => fallback.internal_ip(hostname).await,
            None => Err(Error::NodeNotFound(hostname.to_string())),
        }
    }
}

/// Build the inventory described by `config`: static entries first, then the API server.
pub async fn from_config(config: &InventoryConfig) -> Result<Arc<dyn NodeInventory>> {
    let mut inventory = StaticInventory::new(config.static_nodes.clone());
    if config.api_server.is_some() {
        let kube = KubeInventory::from_config(config).await?;
        inventory = inventory.with_fallback(Arc::new(kube));
    } else if config.static_nodes.is_empty() {
        tracing::warn!("No node inventory configured; remote hosts cannot be resolved");
    }
    Ok(Arc::new(inventory))
}
