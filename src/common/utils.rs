//! Utility functions for meshipam

use crate::common::{Error, Result};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Separator used by every list-valued record in the store.
pub const LIST_DELIMITER: char = ';';

/// Split a delimited record. An empty value is an empty list, not `[""]`.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(LIST_DELIMITER)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join entries into a delimited record.
pub fn join_list<I, T>(items: I) -> String
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    let mut out = String::new();
    for item in items {
        if !out.is_empty() {
            out.push(LIST_DELIMITER);
        }
        out.push_str(item.as_ref());
    }
    out
}

/// Parse a delimited record of IPv4 addresses, failing on the first bad entry.
pub fn parse_addresses(value: &str) -> Result<Vec<Ipv4Addr>> {
    split_list(value)
        .iter()
        .map(|s| s.parse().map_err(|_| Error::invalid_address(s)))
        .collect()
}

/// Same as [`parse_addresses`] but collected into a set.
pub fn parse_address_set(value: &str) -> Result<HashSet<Ipv4Addr>> {
    Ok(parse_addresses(value)?.into_iter().collect())
}

/// Offset an address arithmetically, `None` on overflow.
pub fn offset_addr(addr: Ipv4Addr, offset: u32) -> Option<Ipv4Addr> {
    u32::from(addr).checked_add(offset).map(Ipv4Addr::from)
}

/// Every address from `start` to `end` inclusive.
///
/// Returns `None` when `start >= end`, so a single-address "range" is treated as no range.
pub fn address_range(start: Ipv4Addr, end: Ipv4Addr) -> Option<Vec<Ipv4Addr>> {
    let (start, end) = (u32::from(start), u32::from(end));
    if start >= end {
        return None;
    }
    Some((start..=end).map(Ipv4Addr::from).collect())
}

/// Resolve this machine's hostname.
pub fn local_hostname() -> Result<String> {
    hostname::get()?
        .into_string()
        .map_err(|raw| Error::InvalidConfig(format!("hostname is not UTF-8: {:?}", raw)))
}

/// Bounded exponential backoff: doubles from `initial` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the following call returns twice as much (capped).
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(30))
    }
}
