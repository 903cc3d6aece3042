//! Allocation properties against the in-memory store

use meshipam::ipam::{KeyLayout, SubnetPool};
use meshipam::{Error, IpamOptions, IpamService, MemoryStore};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

async fn service(store: &Arc<MemoryStore>, host: &str, options: IpamOptions) -> IpamService {
    assert_ok!(IpamService::init(store.clone(), host, options).await)
}

#[tokio::test]
async fn test_sequential_hosts_get_distinct_subnets() {
    let store = Arc::new(MemoryStore::new());
    let original: HashSet<Ipv4Addr> = meshipam::ipam::pool::pool_candidates(Ipv4Addr::new(10, 244, 0, 0))
        .unwrap()
        .into_iter()
        .collect();

    let mut seen = HashSet::new();
    for i in 0..40 {
        let ipam = service(&store, &format!("node-{}", i), IpamOptions::new("10.244.0.0/16")).await;
        assert!(original.contains(&ipam.host_subnet()));
        assert!(seen.insert(ipam.host_subnet()));
    }

    let map = IpamService::init(store.clone(), "node-0", IpamOptions::new("10.244.0.0/16"))
        .await
        .unwrap()
        .get()
        .await
        .host_subnet_map()
        .await
        .unwrap();
    assert_eq!(map.len(), 40);
}

#[tokio::test]
async fn test_reassignment_does_not_shrink_pool() {
    let store = Arc::new(MemoryStore::new());
    let layout = KeyLayout::new("meshipam/ipam", Ipv4Addr::new(10, 244, 0, 0), 16);
    let pool = SubnetPool::new(store.clone(), layout, 16);

    let first = service(&store, "node-a", IpamOptions::new("10.244.0.0/16")).await;
    let remaining = pool.remaining().await.unwrap().len();
    let second = service(&store, "node-a", IpamOptions::new("10.244.0.0/16")).await;

    assert_eq!(first.host_subnet(), second.host_subnet());
    assert_eq!(pool.remaining().await.unwrap().len(), remaining);
    assert_eq!(remaining, 255);
}

#[tokio::test]
async fn test_allocations_are_distinct_and_skip_reserved() {
    let store = Arc::new(MemoryStore::new());
    let ipam = service(&store, "node-a", IpamOptions::new("10.244.0.0/16")).await;
    let subnet = ipam.host_subnet();
    let gateway = Ipv4Addr::from(u32::from(subnet) + 1);

    let get = ipam.get().await;
    let mut allocated = HashSet::new();
    for _ in 0..100 {
        let addr = get.unused_ip().await.unwrap();
        assert_ne!(addr, subnet);
        assert_ne!(addr, gateway);
        assert!(allocated.insert(addr), "{} allocated twice", addr);
    }

    let used: HashSet<Ipv4Addr> = get.all_used_ips().await.unwrap().into_iter().collect();
    assert_eq!(used, allocated);
}

#[tokio::test]
async fn test_release_then_reuse() {
    let store = Arc::new(MemoryStore::new());
    let ipam = service(&store, "node-a", IpamOptions::new("10.244.0.0/16")).await;

    let addr = ipam.get().await.unused_ip().await.unwrap();
    assert_ok!(ipam.release().await.ips(&[addr]).await);
    assert!(!ipam.get().await.all_used_ips().await.unwrap().contains(&addr));

    // Fill the subnet; the released address must come back
    let get = ipam.get().await;
    let mut reused = false;
    while let Ok(next) = get.unused_ip().await {
        reused |= next == addr;
    }
    assert!(reused);
    assert_err!(get.unused_ip().await);
}

#[tokio::test]
async fn test_range_scenario() {
    let store = Arc::new(MemoryStore::new());
    let start = Ipv4Addr::new(192, 168, 64, 10);
    let end = Ipv4Addr::new(192, 168, 64, 20);
    let options = IpamOptions::new("192.168.64.0/24").with_range(start, end);
    let ipam = service(&store, "node-a", options).await;

    let get = ipam.get().await;
    let mut allocated = HashSet::new();
    for _ in 0..3 {
        let addr = get.unused_ip().await.unwrap();
        assert!(addr >= start && addr <= end, "{} outside range", addr);
        allocated.insert(addr);
    }
    assert_eq!(allocated.len(), 3);
    assert_eq!(get.all_used_ips().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_range_exhaustion() {
    let store = Arc::new(MemoryStore::new());
    let start = Ipv4Addr::new(10, 244, 200, 10);
    let end = Ipv4Addr::new(10, 244, 200, 13);
    let options = IpamOptions::new("10.244.0.0/16").with_range(start, end);
    let ipam = service(&store, "node-a", options).await;

    let get = ipam.get().await;
    for _ in 0..4 {
        assert_ok!(get.unused_ip().await);
    }
    assert!(matches!(
        get.unused_ip().await,
        Err(Error::AddressRangeExhausted { .. })
    ));
}

#[tokio::test]
async fn test_pool_exhaustion() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..256 {
        service(&store, &format!("node-{}", i), IpamOptions::new("10.244.0.0/16")).await;
    }
    let err = IpamService::init(store.clone(), "node-late", IpamOptions::new("10.244.0.0/16"))
        .await
        .err()
        .expect("pool should be exhausted");
    assert!(matches!(err, Error::PoolExhausted(_)));
}

#[tokio::test]
async fn test_released_subnet_returns_to_pool() {
    let store = Arc::new(MemoryStore::new());
    let ipam = service(&store, "node-a", IpamOptions::new("10.244.0.0/16")).await;
    let subnet = ipam.host_subnet();
    ipam.get().await.unused_ip().await.unwrap();

    assert_eq!(ipam.release().await.pool().await.unwrap(), Some(subnet));
    assert!(ipam.get().await.host_subnet_map().await.unwrap().is_empty());
    let record = ipam.layout().record("node-a", subnet);
    assert!(!store.dump().contains_key(&record));
}
