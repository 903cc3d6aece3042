//! Store key layout
//!
//! ```text
//! /<ns>/<subnet>/<mask>/pool                       -> delimited subnet list
//! /<ns>/<subnet>/<mask>/<hostname>                 -> assigned subnet
//! /<ns>/<subnet>/<mask>/<hostname>/<subnet>        -> delimited used-address list
//! /<ns>/<subnet>/<mask>/<hostname>/<subnet>/range  -> delimited range-address list
//! /<ns>/<subnet>/<mask>/maps                       -> JSON {subnet: hostname}
//! ```

use crate::common::{Error, Result};
use std::net::Ipv4Addr;

const POOL: &str = "pool";
const MAPS: &str = "maps";
const RANGE: &str = "range";

/// Keys of one cluster subnet under one namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    namespace: String,
    subnet: Ipv4Addr,
    mask_len: u8,
}

impl KeyLayout {
    pub fn new(namespace: &str, subnet: Ipv4Addr, mask_len: u8) -> Self {
        Self {
            namespace: namespace.trim_matches('/').to_string(),
            subnet,
            mask_len,
        }
    }

    /// Root of everything this system writes.
    pub fn namespace(&self) -> String {
        format!("/{}", self.namespace)
    }

    pub fn cluster(&self) -> String {
        format!("/{}/{}/{}", self.namespace, self.subnet, self.mask_len)
    }

    pub fn pool(&self) -> String {
        format!("{}/{}", self.cluster(), POOL)
    }

    pub fn maps(&self) -> String {
        format!("{}/{}", self.cluster(), MAPS)
    }

    pub fn host(&self, hostname: &str) -> String {
        format!("{}/{}", self.cluster(), hostname)
    }

    pub fn record(&self, hostname: &str, host_subnet: Ipv4Addr) -> String {
        format!("{}/{}", self.host(hostname), host_subnet)
    }

    pub fn range(&self, hostname: &str, host_subnet: Ipv4Addr) -> String {
        format!("{}/{}", self.record(hostname, host_subnet), RANGE)
    }

    pub fn subnet(&self) -> Ipv4Addr {
        self.subnet
    }

    pub fn mask_len(&self) -> u8 {
        self.mask_len
    }
}

/// Hostnames become key segments, so they must not collide with the fixed ones.
pub fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty() || hostname.contains('/') || hostname == POOL || hostname == MAPS {
        return Err(Error::InvalidConfig(format!(
            "hostname {:?} cannot be used as a store key segment",
            hostname
        )));
    }
    Ok(())
}
