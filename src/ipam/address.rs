//! Address allocator for one host subnet
//!
//! Addresses are marked used in the store at selection time, before the caller
//! configures anything with them. A caller that fails afterwards must `release`.

use super::keys::KeyLayout;
use crate::common::utils::{join_list, offset_addr, parse_address_set, parse_addresses};
use crate::common::{Error, Result};
use crate::store::{retry_on_conflict, CoordinationStore, Mutation, Precondition};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

pub struct AddressAllocator {
    store: Arc<dyn CoordinationStore>,
    record_key: String,
    range_key: String,
    /// Base address of the host subnet as stored in the pool
    base: Ipv4Addr,
    /// Prefix length of the host subnet
    prefix_len: u8,
    cas_retries: usize,
}

impl AddressAllocator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        layout: &KeyLayout,
        hostname: &str,
        base: Ipv4Addr,
        prefix_len: u8,
        cas_retries: usize,
    ) -> Self {
        Self {
            store,
            record_key: layout.record(hostname, base),
            range_key: layout.range(hostname, base),
            base,
            prefix_len,
            cas_retries,
        }
    }

    pub fn record_key(&self) -> &str {
        &self.record_key
    }

    /// `.1` of the host subnet; computed, never stored.
    pub fn gateway(&self) -> Ipv4Addr {
        offset_addr(self.base, 1).unwrap_or(self.base)
    }

    /// Gateway with a mask suffix, as configured on the host bridge.
    pub fn gateway_cidr(&self, mask_len: u8) -> String {
        format!("{}/{}", self.gateway(), mask_len)
    }

    /// Addresses ending in `.0` (network) or `.1` (gateway) are never handed to callers.
    pub fn is_reserved(&self, addr: Ipv4Addr) -> bool {
        matches!(addr.octets()[3], 0 | 1)
    }

    /// Addresses allocatable without a range: network + 2 up to broadcast - 1.
    fn subnet_candidates(&self) -> Vec<Ipv4Addr> {
        let size: u64 = 1u64 << (32 - u32::from(self.prefix_len.min(32)));
        if size < 4 {
            return Vec::new();
        }
        (2..=(size - 2) as u32)
            .filter_map(|offset| offset_addr(self.base, offset))
            .filter(|addr| !self.is_reserved(*addr))
            .collect()
    }

    /// Explicit range list, if one was configured for this subnet.
    pub async fn range(&self) -> Result<Option<Vec<Ipv4Addr>>> {
        let addresses = parse_addresses(&self.store.get(&self.range_key).await?)?;
        Ok((!addresses.is_empty()).then_some(addresses))
    }

    /// Pick a candidate not in `used`, uniformly at random.
    async fn candidate(&self, used: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr> {
        match self.range().await? {
            Some(range) => {
                let free: Vec<Ipv4Addr> = range.iter().copied().filter(|a| !used.contains(a)).collect();
                free.choose(&mut rand::thread_rng()).copied().ok_or_else(|| {
                    Error::range_exhausted(range[0], range[range.len() - 1])
                })
            }
            None => {
                let free: Vec<Ipv4Addr> = self
                    .subnet_candidates()
                    .into_iter()
                    .filter(|a| !used.contains(a))
                    .collect();
                free.choose(&mut rand::thread_rng())
                    .copied()
                    .ok_or_else(|| Error::SubnetExhausted(format!("{}/{}", self.base, self.prefix_len)))
            }
        }
    }

    /// Reserve and return an address nobody on this subnet is using.
    ///
    /// A reserved candidate (only possible when a range covers `.0`/`.1`) is
    /// persisted as used so it is never drawn again, then skipped.
    pub async fn unused_ip(&self) -> Result<Ipv4Addr> {
        let mut conflicts = 0;
        loop {
            let record = self.store.get_versioned(&self.record_key).await?;
            let mut used = parse_addresses(&record.value)?;
            let used_set: HashSet<Ipv4Addr> = used.iter().copied().collect();
            let candidate = self.candidate(&used_set).await?;
            used.push(candidate);

            let applied = self
                .store
                .commit(
                    &[Precondition::unchanged(self.record_key.as_str(), &record)],
                    &[Mutation::put(self.record_key.as_str(), join_list(used.iter().map(|a| a.to_string())))],
                )
                .await?;
            if !applied {
                conflicts += 1;
                if conflicts >= self.cas_retries {
                    return Err(Error::Conflict {
                        key: self.record_key.clone(),
                        attempts: conflicts,
                    });
                }
                continue;
            }
            if self.is_reserved(candidate) {
                tracing::debug!(address = %candidate, "Skipping reserved address");
                continue;
            }
            tracing::debug!(address = %candidate, record = %self.record_key, "Reserved address");
            return Ok(candidate);
        }
    }

    /// The persisted used-set, in stored order.
    pub async fn all_used_ips(&self) -> Result<Vec<Ipv4Addr>> {
        parse_addresses(&self.store.get(&self.record_key).await?)
    }

    /// Add addresses to the used-set; ones already present are left alone.
    pub async fn mark_used(&self, addresses: &[Ipv4Addr]) -> Result<()> {
        self.update(|used| {
            for addr in addresses {
                if !used.contains(addr) {
                    used.push(*addr);
                }
            }
        })
        .await
    }

    /// Remove addresses from the used-set.
    pub async fn release(&self, addresses: &[Ipv4Addr]) -> Result<()> {
        self.update(|used| used.retain(|a| !addresses.contains(a))).await?;
        tracing::debug!(record = %self.record_key, "Released {} address(es)", addresses.len());
        Ok(())
    }

    async fn update<F>(&self, edit: F) -> Result<()>
    where
        F: Fn(&mut Vec<Ipv4Addr>),
    {
        retry_on_conflict(&self.record_key, self.cas_retries, || async {
            let record = self.store.get_versioned(&self.record_key).await?;
            let mut used = parse_addresses(&record.value)?;
            edit(&mut used);
            let applied = self
                .store
                .commit(
                    &[Precondition::unchanged(self.record_key.as_str(), &record)],
                    &[Mutation::put(self.record_key.as_str(), join_list(used.iter().map(|a| a.to_string())))],
                )
                .await?;
            Ok(applied.then_some(()))
        })
        .await
    }

    /// Whether `addr` is currently marked used.
    pub async fn is_used(&self, addr: Ipv4Addr) -> Result<bool> {
        Ok(parse_address_set(&self.store.get(&self.record_key).await?)?.contains(&addr))
    }
}
