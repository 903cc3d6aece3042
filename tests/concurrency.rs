//! Concurrent writers racing on the same store

use meshipam::{IpamOptions, IpamService, MemoryStore};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

fn options() -> IpamOptions {
    let mut options = IpamOptions::new("10.244.0.0/16");
    options.cas_retries = 1_000;
    options
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_hosts_claim_distinct_subnets() {
    let store = Arc::new(MemoryStore::new());
    let mut tasks = Vec::new();
    for i in 0..32 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            IpamService::init(store, &format!("node-{}", i), options())
                .await
                .unwrap()
                .host_subnet()
        }));
    }

    let mut subnets = HashSet::new();
    for task in tasks {
        assert!(subnets.insert(task.await.unwrap()));
    }
    assert_eq!(subnets.len(), 32);
}

/// Separate service instances for one host stand in for separate plugin processes.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_processes_allocate_distinct_addresses() {
    let store = Arc::new(MemoryStore::new());
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let ipam = IpamService::init(store, "node-a", options()).await.unwrap();
            let mut got = Vec::new();
            for _ in 0..25 {
                got.push(ipam.get().await.unused_ip().await.unwrap());
            }
            (ipam.host_subnet(), got)
        }));
    }

    let mut all: HashSet<Ipv4Addr> = HashSet::new();
    let mut subnets = HashSet::new();
    for task in tasks {
        let (subnet, got) = task.await.unwrap();
        subnets.insert(subnet);
        for addr in got {
            assert!(all.insert(addr), "{} handed out twice", addr);
        }
    }
    assert_eq!(subnets.len(), 1);
    assert_eq!(all.len(), 100);

    let ipam = IpamService::init(store, "node-a", options()).await.unwrap();
    let used: HashSet<Ipv4Addr> = ipam.get().await.all_used_ips().await.unwrap().into_iter().collect();
    assert_eq!(used, all);
}
