//! Per-host IPAM service
//!
//! Constructed once per process. Construction initializes the cluster pool (first
//! host only), claims or looks up this host's subnet and registers it in the global
//! subnet map. All later operations go through [`IpamService::get`],
//! [`IpamService::set`] and [`IpamService::release`], which hold the service lock
//! for as long as the returned view lives.

use super::address::AddressAllocator;
use super::keys::{validate_hostname, KeyLayout};
use super::pool::{host_prefix_len, HostSubnetMap, SubnetPool};
use crate::common::{Config, Error, Result};
use crate::inventory::NodeInventory;
use crate::store::CoordinationStore;
use ipnet::Ipv4Net;
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Where the cluster's node registry lives in the shared store
pub const NODE_REGISTRY_PREFIX: &str = "/registry/minions/";

/// Construction parameters
#[derive(Debug, Clone)]
pub struct IpamOptions {
    /// Cluster subnet, optionally with an embedded `/mask` (overrides `mask_len`)
    pub subnet: String,
    pub mask_len: u8,
    /// Prefix reported with each host subnet (defaults to `mask_len`)
    pub pod_mask_len: Option<u8>,
    pub range: Option<(Ipv4Addr, Ipv4Addr)>,
    pub cas_retries: usize,
    pub namespace: String,
}

impl Default for IpamOptions {
    fn default() -> Self {
        Self {
            subnet: "10.244.0.0".to_string(),
            mask_len: 24,
            pod_mask_len: None,
            range: None,
            cas_retries: 16,
            namespace: "meshipam/ipam".to_string(),
        }
    }
}

impl IpamOptions {
    pub fn new(subnet: impl Into<String>) -> Self {
        Self {
            subnet: subnet.into(),
            ..Self::default()
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let ipam = &config.ipam;
        Self {
            subnet: ipam.subnet.clone(),
            mask_len: ipam.mask_len,
            pod_mask_len: ipam.pod_mask_len,
            range: ipam.range_start.zip(ipam.range_end),
            cas_retries: ipam.cas_retries,
            namespace: config.store.namespace.clone(),
        }
    }

    pub fn with_mask_len(mut self, mask_len: u8) -> Self {
        self.mask_len = mask_len;
        self
    }

    pub fn with_pod_mask_len(mut self, pod_mask_len: u8) -> Self {
        self.pod_mask_len = Some(pod_mask_len);
        self
    }

    pub fn with_range(mut self, start: Ipv4Addr, end: Ipv4Addr) -> Self {
        self.range = Some((start, end));
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Resolve the cluster subnet to a normalized network address and mask.
    ///
    /// Accepts `a.b.c.d`, `a.b.c.d/m` and the integer form of an address.
    /// Host bits are masked off.
    pub fn parse_subnet(&self) -> Result<(Ipv4Addr, u8)> {
        let raw = self.subnet.trim();
        let (addr, mask) = match raw.split_once('/') {
            Some((addr, mask)) => {
                let mask = mask
                    .trim()
                    .parse::<u8>()
                    .map_err(|_| Error::InvalidSubnet(raw.to_string()))?;
                (addr.trim(), mask)
            }
            None => (raw, self.mask_len),
        };
        let addr = addr
            .parse::<Ipv4Addr>()
            .or_else(|_| addr.parse::<u32>().map(Ipv4Addr::from))
            .map_err(|_| Error::InvalidSubnet(raw.to_string()))?;

        let net = Ipv4Net::new(addr, mask)?.trunc();
        Ok((net.network(), mask))
    }
}

/// One cluster node as seen by the IPAM layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostNetwork {
    pub hostname: String,
    pub ip: Ipv4Addr,
    /// `subnet/pod_mask`, absent for nodes without an assignment
    pub cidr: Option<String>,
    pub is_current: bool,
}

#[derive(Default)]
struct Caches {
    cidr: HashMap<String, String>,
    node_ip: HashMap<String, Ipv4Addr>,
}

pub struct IpamService {
    store: Arc<dyn CoordinationStore>,
    layout: KeyLayout,
    pool: SubnetPool,
    hostname: String,
    host_subnet: Ipv4Addr,
    host_prefix_len: u8,
    pod_mask_len: u8,
    cas_retries: usize,
    inventory: Option<Arc<dyn NodeInventory>>,
    lock: Mutex<Caches>,
}

impl IpamService {
    /// Set up the pool, this host's subnet and its map entry.
    pub async fn init(
        store: Arc<dyn CoordinationStore>,
        hostname: &str,
        options: IpamOptions,
    ) -> Result<Self> {
        validate_hostname(hostname)?;
        let (subnet, mask_len) = options.parse_subnet()?;
        let layout = KeyLayout::new(&options.namespace, subnet, mask_len);
        let pool = SubnetPool::new(store.clone(), layout.clone(), options.cas_retries);

        pool.init_pool().await?;
        let host_subnet = pool.assign_subnet(hostname, options.range).await?;
        pool.register_host(host_subnet, hostname).await?;

        tracing::info!(
            host = %hostname,
            cluster = %format!("{}/{}", subnet, mask_len),
            subnet = %host_subnet,
            "IPAM initialized"
        );

        Ok(Self {
            store,
            pool,
            hostname: hostname.to_string(),
            host_subnet,
            host_prefix_len: host_prefix_len(subnet)?,
            pod_mask_len: options.pod_mask_len.unwrap_or(mask_len),
            cas_retries: options.cas_retries,
            inventory: None,
            layout,
            lock: Mutex::new(Caches::default()),
        })
    }

    /// Attach a node inventory for `node_ip` and `host_networks`.
    pub fn with_inventory(mut self, inventory: Arc<dyn NodeInventory>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    pub async fn get(&self) -> Getter<'_> {
        Getter {
            service: self,
            caches: self.lock.lock().await,
        }
    }

    pub async fn set(&self) -> Setter<'_> {
        Setter {
            service: self,
            _guard: self.lock.lock().await,
        }
    }

    pub async fn release(&self) -> Releaser<'_> {
        Releaser {
            service: self,
            caches: self.lock.lock().await,
        }
    }

    /// Delete everything under the namespace. Meant for tests and teardown.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let prefix = format!("{}/", self.layout.namespace());
        self.store.delete(&prefix, true).await?;
        tracing::warn!(prefix = %prefix, "Cleared IPAM state");
        Ok(())
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    pub fn store(&self) -> Arc<dyn CoordinationStore> {
        self.store.clone()
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Subnet claimed at construction time.
    pub fn host_subnet(&self) -> Ipv4Addr {
        self.host_subnet
    }

    pub fn pod_mask_len(&self) -> u8 {
        self.pod_mask_len
    }

    /// Allocator for the subnet currently assigned to this host.
    async fn allocator(&self) -> Result<AddressAllocator> {
        let subnet = self
            .pool
            .assigned(&self.hostname)
            .await?
            .ok_or_else(|| Error::SubnetNotAssigned(self.hostname.clone()))?;
        Ok(AddressAllocator::new(
            self.store.clone(),
            &self.layout,
            &self.hostname,
            subnet,
            self.host_prefix_len,
            self.cas_retries,
        ))
    }
}

/// Read and allocate operations
pub struct Getter<'a> {
    service: &'a IpamService,
    caches: MutexGuard<'a, Caches>,
}

impl Getter<'_> {
    pub fn mask_len(&self) -> u8 {
        self.service.layout.mask_len()
    }

    /// Cluster subnet as `subnet/mask`.
    pub fn current_subnet(&self) -> String {
        format!("{}/{}", self.service.layout.subnet(), self.service.layout.mask_len())
    }

    pub fn host_subnet_map_path(&self) -> String {
        self.service.layout.maps()
    }

    pub async fn host_subnet_map(&self) -> Result<HostSubnetMap> {
        self.service.pool.host_subnet_map().await
    }

    /// Reserve a free address on this host's subnet.
    pub async fn unused_ip(&self) -> Result<Ipv4Addr> {
        self.service.allocator().await?.unused_ip().await
    }

    pub async fn all_used_ips(&self) -> Result<Vec<Ipv4Addr>> {
        self.service.allocator().await?.all_used_ips().await
    }

    pub async fn gateway(&self) -> Result<Ipv4Addr> {
        Ok(self.service.allocator().await?.gateway())
    }

    /// Gateway with the cluster mask suffix.
    pub async fn gateway_cidr(&self) -> Result<String> {
        Ok(self
            .service
            .allocator()
            .await?
            .gateway_cidr(self.service.layout.mask_len()))
    }

    /// `subnet/pod_mask` assigned to `hostname`, `None` if it has none.
    ///
    /// Only this host's CIDR is cached; other hosts can release and reclaim at any time.
    pub async fn cidr(&mut self, hostname: &str) -> Result<Option<String>> {
        let local = hostname == self.service.hostname;
        if local {
            if let Some(cidr) = self.caches.cidr.get(hostname) {
                return Ok(Some(cidr.clone()));
            }
        }
        let Some(subnet) = self.service.pool.assigned(hostname).await? else {
            return Ok(None);
        };
        let cidr = format!("{}/{}", subnet, self.service.pod_mask_len);
        if local {
            self.caches.cidr.insert(hostname.to_string(), cidr.clone());
        }
        Ok(Some(cidr))
    }

    pub async fn record_path_by_host(&self, hostname: &str) -> Result<Option<String>> {
        Ok(self
            .service
            .pool
            .assigned(hostname)
            .await?
            .map(|subnet| self.service.layout.record(hostname, subnet)))
    }

    /// Addresses in use on `hostname`'s subnet.
    pub async fn record_by_host(&self, hostname: &str) -> Result<Vec<Ipv4Addr>> {
        let path = self
            .record_path_by_host(hostname)
            .await?
            .ok_or_else(|| Error::SubnetNotAssigned(hostname.to_string()))?;
        crate::common::utils::parse_addresses(&self.service.store.get(&path).await?)
    }

    /// Node names registered in the cluster's node registry.
    pub async fn node_names(&self) -> Result<Vec<String>> {
        let keys = self.service.store.keys_with_prefix(NODE_REGISTRY_PREFIX).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(NODE_REGISTRY_PREFIX).map(str::to_string))
            .filter(|name| !name.is_empty())
            .collect())
    }

    /// Internal IP of `hostname`, cached after the first lookup.
    pub async fn node_ip(&mut self, hostname: &str) -> Result<Ipv4Addr> {
        if let Some(ip) = self.caches.node_ip.get(hostname) {
            return Ok(*ip);
        }
        let inventory = self
            .service
            .inventory
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("no node inventory configured".into()))?;
        let ip = inventory.internal_ip(hostname).await?;
        self.caches.node_ip.insert(hostname.to_string(), ip);
        Ok(ip)
    }

    /// Every registered node with its IP and CIDR.
    pub async fn host_networks(&mut self) -> Result<Vec<HostNetwork>> {
        let mut networks = Vec::new();
        for name in self.node_names().await? {
            let ip = self.node_ip(&name).await?;
            let cidr = self.cidr(&name).await?;
            networks.push(HostNetwork {
                is_current: name == self.service.hostname,
                hostname: name,
                ip,
                cidr,
            });
        }
        Ok(networks)
    }

    pub async fn other_host_networks(&mut self) -> Result<Vec<HostNetwork>> {
        Ok(self
            .host_networks()
            .await?
            .into_iter()
            .filter(|n| !n.is_current)
            .collect())
    }
}

/// Record operations
pub struct Setter<'a> {
    service: &'a IpamService,
    _guard: MutexGuard<'a, Caches>,
}

impl Setter<'_> {
    /// Mark addresses as used on this host's subnet.
    pub async fn ips(&self, addresses: &[Ipv4Addr]) -> Result<()> {
        self.service.allocator().await?.mark_used(addresses).await
    }
}

/// Release operations
pub struct Releaser<'a> {
    service: &'a IpamService,
    caches: MutexGuard<'a, Caches>,
}

impl Releaser<'_> {
    /// Return addresses to this host's subnet.
    pub async fn ips(&self, addresses: &[Ipv4Addr]) -> Result<()> {
        self.service.allocator().await?.release(addresses).await
    }

    /// Give this host's subnet back to the pool.
    pub async fn pool(&mut self) -> Result<Option<Ipv4Addr>> {
        let released = self.service.pool.release_subnet(&self.service.hostname).await?;
        self.caches.cidr.remove(&self.service.hostname);
        Ok(released)
    }
}
