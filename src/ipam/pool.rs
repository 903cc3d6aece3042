//! Subnet pool allocator
//!
//! The pool is one delimited list of candidate host subnets. Each host claims one
//! entry, chosen at a uniformly random index. Claims, releases and map updates are
//! compare-and-swap transactions, so concurrent writers (other processes, other
//! hosts) retry instead of overwriting each other.

use super::keys::KeyLayout;
use crate::common::utils::{address_range, join_list, parse_addresses};
use crate::common::{Error, Result};
use crate::store::{retry_on_conflict, CoordinationStore, Mutation, Precondition};
use rand::Rng;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Global `subnet -> hostname` map
pub type HostSubnetMap = BTreeMap<String, String>;

/// Candidate subnets: every value 0..=255 substituted into the first zero octet.
///
/// `10.244.0.0` yields `10.244.0.0 ... 10.244.255.0`.
pub fn pool_candidates(cluster: Ipv4Addr) -> Result<Vec<Ipv4Addr>> {
    let octets = cluster.octets();
    let index = octets
        .iter()
        .position(|&o| o == 0)
        .ok_or_else(|| Error::InvalidSubnet(format!("{} has no zero octet to enumerate", cluster)))?;

    Ok((0..=255u8)
        .map(|value| {
            let mut candidate = octets;
            candidate[index] = value;
            Ipv4Addr::from(candidate)
        })
        .collect())
}

/// Prefix length of one pool entry: the enumerated octet and everything before it.
///
/// `10.244.0.0` splits into /24 blocks, `192.168.64.0` into single addresses.
pub fn host_prefix_len(cluster: Ipv4Addr) -> Result<u8> {
    cluster
        .octets()
        .iter()
        .position(|&o| o == 0)
        .map(|index| 8 * (index as u8 + 1))
        .ok_or_else(|| Error::InvalidSubnet(format!("{} has no zero octet to enumerate", cluster)))
}

/// Decode the stored map; an absent key is an empty map.
pub fn decode_host_subnet_map(raw: &str) -> Result<HostSubnetMap> {
    if raw.trim().is_empty() {
        return Ok(HostSubnetMap::new());
    }
    Ok(serde_json::from_str(raw)?)
}

pub async fn read_host_subnet_map(
    store: &dyn CoordinationStore,
    layout: &KeyLayout,
) -> Result<HostSubnetMap> {
    decode_host_subnet_map(&store.get(&layout.maps()).await?)
}

pub struct SubnetPool {
    store: Arc<dyn CoordinationStore>,
    layout: KeyLayout,
    cas_retries: usize,
}

impl SubnetPool {
    pub fn new(store: Arc<dyn CoordinationStore>, layout: KeyLayout, cas_retries: usize) -> Self {
        Self {
            store,
            layout,
            cas_retries,
        }
    }

    /// Write the candidate list unless a non-empty pool already exists.
    ///
    /// Returns whether this call initialized it.
    pub async fn init_pool(&self) -> Result<bool> {
        let key = self.layout.pool();
        let candidates = pool_candidates(self.layout.subnet())?;
        let value = join_list(candidates.iter().map(|c| c.to_string()));

        retry_on_conflict(&key, self.cas_retries, || async {
            let current = self.store.get_versioned(&key).await?;
            if !current.value.is_empty() {
                return Ok(Some(false));
            }
            let applied = self
                .store
                .commit(
                    &[Precondition::unchanged(key.as_str(), &current)],
                    &[Mutation::put(key.as_str(), value.as_str())],
                )
                .await?;
            if applied {
                tracing::info!(pool = %key, "Initialized subnet pool with {} entries", candidates.len());
            }
            Ok(applied.then_some(true))
        })
        .await
    }

    /// Subnet already assigned to `hostname`, if any.
    pub async fn assigned(&self, hostname: &str) -> Result<Option<Ipv4Addr>> {
        let raw = self.store.get(&self.layout.host(hostname)).await?;
        parse_optional(&raw)
    }

    /// Return the host's subnet, claiming one from the pool on first call.
    ///
    /// When `range` is given and a subnet is newly claimed, the explicit address
    /// list is persisted under the range key in the same transaction.
    pub async fn assign_subnet(
        &self,
        hostname: &str,
        range: Option<(Ipv4Addr, Ipv4Addr)>,
    ) -> Result<Ipv4Addr> {
        let host_key = self.layout.host(hostname);
        let pool_key = self.layout.pool();

        retry_on_conflict(&host_key, self.cas_retries, || async {
            let host = self.store.get_versioned(&host_key).await?;
            if let Some(existing) = parse_optional(&host.value)? {
                return Ok(Some(existing));
            }

            let pool = self.store.get_versioned(&pool_key).await?;
            let mut candidates = parse_addresses(&pool.value)?;
            if candidates.is_empty() {
                return Err(Error::PoolExhausted(self.layout.cluster()));
            }
            let index = rand::thread_rng().gen_range(0..candidates.len());
            let chosen = candidates.remove(index);

            let mut mutations = vec![
                Mutation::put(pool_key.as_str(), join_list(candidates.iter().map(|c| c.to_string()))),
                Mutation::put(host_key.as_str(), chosen.to_string()),
            ];
            if let Some(addresses) = range.and_then(|(start, end)| address_range(start, end)) {
                mutations.push(Mutation::put(
                    self.layout.range(hostname, chosen),
                    join_list(addresses.iter().map(|a| a.to_string())),
                ));
            }

            let guards = [
                Precondition::unchanged(pool_key.as_str(), &pool),
                Precondition::unchanged(host_key.as_str(), &host),
            ];
            if !self.store.commit(&guards, &mutations).await? {
                return Ok(None);
            }
            tracing::info!(host = %hostname, subnet = %chosen, "Claimed subnet from pool");
            Ok(Some(chosen))
        })
        .await
    }

    /// Give the host's subnet back to the pool.
    ///
    /// Clears the assignment, its address record and range, and the host's entry in
    /// the subnet map, all in one transaction. Returns the released subnet.
    pub async fn release_subnet(&self, hostname: &str) -> Result<Option<Ipv4Addr>> {
        let host_key = self.layout.host(hostname);
        let pool_key = self.layout.pool();
        let maps_key = self.layout.maps();

        retry_on_conflict(&host_key, self.cas_retries, || async {
            let host = self.store.get_versioned(&host_key).await?;
            let Some(subnet) = parse_optional(&host.value)? else {
                return Ok(Some(None));
            };
            let pool = self.store.get_versioned(&pool_key).await?;
            let maps = self.store.get_versioned(&maps_key).await?;

            let mut candidates = parse_addresses(&pool.value)?;
            if !candidates.contains(&subnet) {
                candidates.push(subnet);
            }
            let mut map = decode_host_subnet_map(&maps.value)?;
            let subnet_key = subnet.to_string();
            if map.get(&subnet_key).is_some_and(|owner| owner == hostname) {
                map.remove(&subnet_key);
            }

            let mutations = [
                Mutation::put(pool_key.as_str(), join_list(candidates.iter().map(|c| c.to_string()))),
                Mutation::delete(host_key.as_str()),
                Mutation::delete(self.layout.record(hostname, subnet)),
                Mutation::delete(self.layout.range(hostname, subnet)),
                Mutation::put(maps_key.as_str(), serde_json::to_string(&map)?),
            ];
            let guards = [
                Precondition::unchanged(host_key.as_str(), &host),
                Precondition::unchanged(pool_key.as_str(), &pool),
                Precondition::unchanged(maps_key.as_str(), &maps),
            ];
            if !self.store.commit(&guards, &mutations).await? {
                return Ok(None);
            }
            tracing::info!(host = %hostname, subnet = %subnet, "Released subnet back to pool");
            Ok(Some(Some(subnet)))
        })
        .await
    }

    /// Record `subnet -> hostname` in the global map. Existing entries are kept.
    pub async fn register_host(&self, subnet: Ipv4Addr, hostname: &str) -> Result<()> {
        let maps_key = self.layout.maps();
        let subnet_key = subnet.to_string();

        retry_on_conflict(&maps_key, self.cas_retries, || async {
            let maps = self.store.get_versioned(&maps_key).await?;
            let mut map = decode_host_subnet_map(&maps.value)?;
            if let Some(owner) = map.get(&subnet_key) {
                if owner != hostname {
                    tracing::warn!(subnet = %subnet_key, owner = %owner, host = %hostname,
                        "Subnet already mapped to another host");
                }
                return Ok(Some(()));
            }
            map.insert(subnet_key.clone(), hostname.to_string());
            let applied = self
                .store
                .commit(
                    &[Precondition::unchanged(maps_key.as_str(), &maps)],
                    &[Mutation::put(maps_key.as_str(), serde_json::to_string(&map)?)],
                )
                .await?;
            Ok(applied.then_some(()))
        })
        .await
    }

    pub async fn host_subnet_map(&self) -> Result<HostSubnetMap> {
        read_host_subnet_map(self.store.as_ref(), &self.layout).await
    }

    /// Subnets still unclaimed.
    pub async fn remaining(&self) -> Result<Vec<Ipv4Addr>> {
        parse_addresses(&self.store.get(&self.layout.pool()).await?)
    }
}

fn parse_optional(raw: &str) -> Result<Option<Ipv4Addr>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse().map(Some).map_err(|_| Error::invalid_address(raw))
}
