//! IP address management
//!
//! - [`pool`]: one subnet per host out of the cluster subnet
//! - [`address`]: addresses within a host subnet
//! - [`service`]: the per-host entry point tying both together

pub mod address;
pub mod keys;
pub mod pool;
pub mod service;

pub use address::AddressAllocator;
pub use keys::KeyLayout;
pub use pool::{decode_host_subnet_map, read_host_subnet_map, HostSubnetMap, SubnetPool};
pub use service::{Getter, HostNetwork, IpamOptions, IpamService, Releaser, Setter};
