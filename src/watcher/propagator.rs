//! Change propagation
//!
//! Mirrors every remote host's address record into the local fast-path table.
//!
//! ```text
//!   Idle ──run()──> Bootstrapping ──> Watching ──cancel()──> Cancelled
//! ```
//!
//! Bootstrapping replaces the whole table with what the store holds right now,
//! retrying with backoff until the store answers. A record that does not parse is
//! skipped and picked up again by its subscription's resync.
//! Watching keeps one subscription per remote record key plus one on the subnet
//! map; every event funnels through a single channel into one apply loop, so
//! handlers never run concurrently. Subscriptions only ever grow.

use super::fastpath::FastPathTable;
use crate::common::utils::parse_addresses;
use crate::common::{Backoff, Result};
use crate::inventory::NodeInventory;
use crate::ipam::{decode_host_subnet_map, IpamService, KeyLayout};
use crate::store::{CoordinationStore, EventKind, WatchEvent, WatchRegistry};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PropagatorState {
    Idle,
    Bootstrapping,
    Watching,
    Cancelled,
}

/// Apply-loop bookkeeping, owned by `run`
#[derive(Default)]
struct Tracker {
    /// Record key -> owning hostname
    hosts: HashMap<String, String>,
    /// Record key -> addresses installed from it
    installed: HashMap<String, BTreeSet<Ipv4Addr>>,
    /// Key -> highest revision applied
    applied: HashMap<String, i64>,
}

impl Tracker {
    fn is_stale(&self, event: &WatchEvent) -> bool {
        event.kind != EventKind::Resync
            && self
                .applied
                .get(&event.key)
                .is_some_and(|last| event.revision <= *last)
    }

    fn mark_applied(&mut self, key: &str, revision: i64) {
        let last = self.applied.entry(key.to_string()).or_insert(revision);
        *last = (*last).max(revision);
    }
}

pub struct Propagator {
    store: Arc<dyn CoordinationStore>,
    layout: KeyLayout,
    hostname: String,
    inventory: Arc<dyn NodeInventory>,
    table: Arc<dyn FastPathTable>,
    backoff: Backoff,
    event_buffer: usize,
    cancel: CancellationToken,
    registry: WatchRegistry,
    state: Mutex<PropagatorState>,
}

impl Propagator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        layout: KeyLayout,
        hostname: &str,
        inventory: Arc<dyn NodeInventory>,
        table: Arc<dyn FastPathTable>,
    ) -> Self {
        let backoff = Backoff::default();
        let cancel = CancellationToken::new();
        Self {
            registry: WatchRegistry::new(store.clone(), backoff.clone(), cancel.child_token()),
            store,
            layout,
            hostname: hostname.to_string(),
            inventory,
            table,
            backoff,
            event_buffer: 256,
            cancel,
            state: Mutex::new(PropagatorState::Idle),
        }
    }

    /// Propagator for the cluster and host an IPAM service was built for.
    pub fn for_service(
        ipam: &IpamService,
        inventory: Arc<dyn NodeInventory>,
        table: Arc<dyn FastPathTable>,
    ) -> Self {
        Self::new(ipam.store(), ipam.layout().clone(), ipam.hostname(), inventory, table)
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.registry = WatchRegistry::new(self.store.clone(), backoff.clone(), self.cancel.child_token());
        self.backoff = backoff;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.registry = WatchRegistry::new(self.store.clone(), self.backoff.clone(), cancel.child_token());
        self.cancel = cancel;
        self
    }

    pub fn with_event_buffer(mut self, event_buffer: usize) -> Self {
        self.event_buffer = event_buffer.max(1);
        self
    }

    pub fn state(&self) -> PropagatorState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: PropagatorState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
        tracing::info!(state = ?state, "Propagator state changed");
    }

    /// Keys currently watched, sorted.
    pub fn watched(&self) -> Vec<String> {
        self.registry.watched()
    }

    pub fn table(&self) -> Arc<dyn FastPathTable> {
        self.table.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the apply loop and every watch.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Bootstrap, then apply events until cancelled.
    pub async fn run(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            self.set_state(PropagatorState::Cancelled);
            return Ok(());
        }
        self.set_state(PropagatorState::Bootstrapping);
        let Some(mut tracker) = self.bootstrap_until_ready().await else {
            self.set_state(PropagatorState::Cancelled);
            return Ok(());
        };

        let (tx, mut rx) = mpsc::channel(self.event_buffer);
        self.registry.subscribe(&self.layout.maps(), tx.clone());
        for key in tracker.hosts.keys() {
            self.registry.subscribe(key, tx.clone());
        }
        self.set_state(PropagatorState::Watching);

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = rx.recv() => event,
            };
            let Some(event) = event else { break };
            if tracker.is_stale(&event) {
                tracing::debug!(key = %event.key, revision = event.revision, "Dropping stale event");
                continue;
            }
            match self.apply(&event, &mut tracker, &tx).await {
                Ok(()) => tracker.mark_applied(&event.key, event.revision),
                Err(e) => tracing::warn!(key = %event.key, "Failed to apply event: {}", e),
            }
        }

        // Watch loops may be parked on a full channel
        drop(rx);
        self.registry.shutdown().await;
        self.set_state(PropagatorState::Cancelled);
        Ok(())
    }

    /// Bootstrap until it succeeds; `None` if cancelled first.
    async fn bootstrap_until_ready(&self) -> Option<Tracker> {
        let mut backoff = self.backoff.clone();
        loop {
            let mut tracker = Tracker::default();
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = self.bootstrap(&mut tracker) => result,
            };
            let e = match result {
                Ok(()) => return Some(tracker),
                Err(e) => e,
            };
            let delay = backoff.next_delay();
            tracing::warn!("Bootstrap failed, retrying in {:?}: {}", delay, e);
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Replace the table with every remote host's current addresses.
    async fn bootstrap(&self, tracker: &mut Tracker) -> Result<()> {
        let maps = self.store.get_versioned(&self.layout.maps()).await?;
        let remote = self.remote_records(&maps.value)?;

        let mut batch = Vec::new();
        for (key, host) in remote {
            let record = self.store.get_versioned(&key).await?;
            let addresses: BTreeSet<Ipv4Addr> = match parse_addresses(&record.value) {
                Ok(addresses) => addresses.into_iter().collect(),
                Err(e) => {
                    tracing::warn!(host = %host, key = %key, "Skipping unreadable record: {}", e);
                    tracker.hosts.insert(key, host);
                    continue;
                }
            };
            match self.inventory.internal_ip(&host).await {
                Ok(host_ip) => {
                    batch.extend(addresses.iter().map(|addr| (*addr, host_ip)));
                    tracker.installed.insert(key.clone(), addresses);
                    tracker.mark_applied(&key, record.revision);
                }
                // Left for the subscription's resync to retry
                Err(e) => tracing::warn!(host = %host, "Cannot resolve host IP: {}", e),
            }
            tracker.hosts.insert(key, host);
        }
        tracker.mark_applied(&self.layout.maps(), maps.revision);

        self.table.clear()?;
        self.table.batch_put(&batch)?;
        tracing::info!(
            hosts = tracker.hosts.len(),
            entries = batch.len(),
            "Bootstrapped fast-path table"
        );
        Ok(())
    }

    async fn apply(
        &self,
        event: &WatchEvent,
        tracker: &mut Tracker,
        tx: &mpsc::Sender<WatchEvent>,
    ) -> Result<()> {
        if event.key == self.layout.maps() {
            for (key, host) in self.remote_records(&event.value)? {
                if tracker.hosts.contains_key(&key) {
                    continue;
                }
                tracing::info!(host = %host, key = %key, "New remote host");
                tracker.hosts.insert(key.clone(), host);
                self.registry.subscribe(&key, tx.clone());
            }
            return Ok(());
        }

        let Some(host) = tracker.hosts.get(&event.key).cloned() else {
            tracing::debug!(key = %event.key, "Event for untracked key");
            return Ok(());
        };
        self.replace_host(&event.key, &host, &event.value, tracker).await
    }

    /// Bring the table in line with one record: drop stale entries, put current ones.
    async fn replace_host(
        &self,
        key: &str,
        host: &str,
        value: &str,
        tracker: &mut Tracker,
    ) -> Result<()> {
        let current: BTreeSet<Ipv4Addr> = parse_addresses(value)?.into_iter().collect();
        let host_ip = self.inventory.internal_ip(host).await?;

        let previous = tracker.installed.remove(key).unwrap_or_default();
        for stale in previous.difference(&current) {
            self.table.delete(*stale)?;
        }
        let batch: Vec<(Ipv4Addr, Ipv4Addr)> = current.iter().map(|addr| (*addr, host_ip)).collect();
        self.table.batch_put(&batch)?;

        tracing::debug!(
            host = %host,
            removed = previous.difference(&current).count(),
            installed = batch.len(),
            "Replaced host entries"
        );
        tracker.installed.insert(key.to_string(), current);
        Ok(())
    }

    /// Record key -> hostname for every host in the map except this one.
    fn remote_records(&self, raw_map: &str) -> Result<Vec<(String, String)>> {
        let map = decode_host_subnet_map(raw_map)?;
        Ok(map
            .into_iter()
            .filter(|(_, host)| *host != self.hostname)
            .filter_map(|(subnet, host)| match subnet.parse::<Ipv4Addr>() {
                Ok(subnet) => Some((self.layout.record(&host, subnet), host)),
                Err(_) => {
                    tracing::warn!(subnet = %subnet, host = %host, "Skipping malformed map entry");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::StaticInventory;
    use crate::store::MemoryStore;
    use crate::watcher::MemoryFastPath;
    use std::collections::BTreeMap;
    use std::time::Duration;

    const NODE_B_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 12);

    fn layout() -> KeyLayout {
        KeyLayout::new("test/ipam", Ipv4Addr::new(10, 244, 0, 0), 16)
    }

    fn propagator(store: Arc<MemoryStore>) -> Arc<Propagator> {
        let mut inventory = StaticInventory::default();
        inventory.insert("node-b", NODE_B_IP);
        inventory.insert("node-c", Ipv4Addr::new(192, 168, 1, 13));
        Arc::new(
            Propagator::new(store, layout(), "node-a", Arc::new(inventory), Arc::new(MemoryFastPath::new()))
                .with_backoff(Backoff::new(Duration::from_millis(5), Duration::from_millis(20))),
        )
    }

    async fn wait_for<F>(propagator: &Propagator, check: F)
    where
        F: Fn(&BTreeMap<Ipv4Addr, Ipv4Addr>) -> bool,
    {
        for _ in 0..500 {
            if check(&propagator.table().entries().unwrap()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("table never converged: {:?}", propagator.table().entries().unwrap());
    }

    fn addr(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 244, 5, last)
    }

    fn spawn_run(p: &Arc<Propagator>) -> tokio::task::JoinHandle<Result<()>> {
        let p = p.clone();
        tokio::spawn(async move { p.run().await })
    }

    /// Answers every lookup after a delay
    struct SlowInventory;

    #[async_trait::async_trait]
    impl NodeInventory for SlowInventory {
        async fn internal_ip(&self, _hostname: &str) -> Result<Ipv4Addr> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(NODE_B_IP)
        }
    }

    #[test]
    fn test_stale_detection() {
        let mut tracker = Tracker::default();
        tracker.mark_applied("/k", 10);
        let event = |kind, revision| WatchEvent {
            kind,
            key: "/k".into(),
            value: String::new(),
            revision,
        };
        assert!(tracker.is_stale(&event(EventKind::Put, 9)));
        assert!(tracker.is_stale(&event(EventKind::Put, 10)));
        assert!(!tracker.is_stale(&event(EventKind::Put, 11)));
        assert!(!tracker.is_stale(&event(EventKind::Resync, 3)));

        tracker.mark_applied("/k", 3);
        assert!(tracker.is_stale(&event(EventKind::Delete, 10)));
    }

    #[tokio::test]
    async fn test_bootstrap_skips_own_host() {
        let store = Arc::new(MemoryStore::new());
        let layout = layout();
        store
            .set(&layout.maps(), r#"{"10.244.5.0":"node-b","10.244.6.0":"node-a"}"#)
            .await
            .unwrap();
        store.set(&layout.record("node-b", addr(0)), "10.244.5.10").await.unwrap();
        store
            .set(&layout.record("node-a", Ipv4Addr::new(10, 244, 6, 0)), "10.244.6.10")
            .await
            .unwrap();

        let p = propagator(store);
        let runner = tokio::spawn({
            let p = p.clone();
            async move { p.run().await }
        });

        wait_for(&p, |t| t.len() == 1 && t.get(&addr(10)) == Some(&NODE_B_IP)).await;
        p.cancel();
        runner.await.unwrap().unwrap();
        assert_eq!(p.state(), PropagatorState::Cancelled);
    }

    #[tokio::test]
    async fn test_new_host_in_map_gets_watched() {
        let store = Arc::new(MemoryStore::new());
        let layout = layout();
        store.set(&layout.maps(), r#"{"10.244.5.0":"node-b"}"#).await.unwrap();

        let p = propagator(store.clone());
        let runner = tokio::spawn({
            let p = p.clone();
            async move { p.run().await }
        });
        while p.state() != PropagatorState::Watching {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let node_c = layout.record("node-c", Ipv4Addr::new(10, 244, 7, 0));
        store.set(&node_c, "10.244.7.20").await.unwrap();
        store
            .set(&layout.maps(), r#"{"10.244.5.0":"node-b","10.244.7.0":"node-c"}"#)
            .await
            .unwrap();

        wait_for(&p, |t| t.get(&Ipv4Addr::new(10, 244, 7, 20)).is_some()).await;
        assert!(p.watched().contains(&node_c));

        // Dropping the host from the map keeps its watch
        store.set(&layout.maps(), r#"{"10.244.5.0":"node-b"}"#).await.unwrap();
        store.set(&node_c, "10.244.7.21").await.unwrap();
        wait_for(&p, |t| {
            t.get(&Ipv4Addr::new(10, 244, 7, 21)).is_some() && t.get(&Ipv4Addr::new(10, 244, 7, 20)).is_none()
        })
        .await;

        p.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_survives_stream_loss() {
        let store = Arc::new(MemoryStore::new());
        let layout = layout();
        let node_b = layout.record("node-b", addr(0));
        store.set(&layout.maps(), r#"{"10.244.5.0":"node-b"}"#).await.unwrap();
        store.set(&node_b, "10.244.5.10").await.unwrap();

        let p = propagator(store.clone());
        let runner = tokio::spawn({
            let p = p.clone();
            async move { p.run().await }
        });
        wait_for(&p, |t| t.contains_key(&addr(10))).await;

        store.disconnect_watches();
        store.set(&node_b, "10.244.5.30").await.unwrap();
        wait_for(&p, |t| t.len() == 1 && t.contains_key(&addr(30))).await;

        p.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bootstrap_replaces_existing_entries() {
        let store = Arc::new(MemoryStore::new());
        let layout = layout();
        store.set(&layout.maps(), r#"{"10.244.5.0":"node-b"}"#).await.unwrap();
        store.set(&layout.record("node-b", addr(0)), "10.244.5.10").await.unwrap();

        let p = propagator(store);
        let leftover = Ipv4Addr::new(10, 244, 9, 9);
        p.table().put(leftover, Ipv4Addr::new(192, 168, 1, 99)).unwrap();
        p.table().put(addr(11), NODE_B_IP).unwrap();

        let runner = spawn_run(&p);
        wait_for(&p, |t| t.len() == 1 && t.get(&addr(10)) == Some(&NODE_B_IP)).await;
        assert!(!p.table().entries().unwrap().contains_key(&leftover));

        p.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bootstrap_skips_unreadable_record() {
        let store = Arc::new(MemoryStore::new());
        let layout = layout();
        let node_b = layout.record("node-b", addr(0));
        store
            .set(&layout.maps(), r#"{"10.244.5.0":"node-b","10.244.7.0":"node-c"}"#)
            .await
            .unwrap();
        store.set(&node_b, "10.244.5.10;bogus").await.unwrap();
        store
            .set(&layout.record("node-c", Ipv4Addr::new(10, 244, 7, 0)), "10.244.7.20")
            .await
            .unwrap();

        let p = propagator(store.clone());
        let runner = spawn_run(&p);
        wait_for(&p, |t| t.contains_key(&Ipv4Addr::new(10, 244, 7, 20))).await;
        assert_eq!(p.state(), PropagatorState::Watching);
        assert!(p.watched().contains(&node_b));

        // Repairing the record installs it through the watch
        store.set(&node_b, "10.244.5.10").await.unwrap();
        wait_for(&p, |t| t.len() == 2 && t.get(&addr(10)) == Some(&NODE_B_IP)).await;

        p.cancel();
        runner.await.unwrap().unwrap();
        assert_eq!(p.state(), PropagatorState::Cancelled);
    }

    #[tokio::test]
    async fn test_bootstrap_waits_for_store() {
        let store = Arc::new(MemoryStore::new());
        let layout = layout();
        store.set(&layout.maps(), r#"{"10.244.5.0":"node-b"}"#).await.unwrap();
        store.set(&layout.record("node-b", addr(0)), "10.244.5.10").await.unwrap();
        store.set_available(false);

        let p = propagator(store.clone());
        let runner = spawn_run(&p);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(p.state(), PropagatorState::Bootstrapping);

        store.set_available(true);
        wait_for(&p, |t| t.contains_key(&addr(10))).await;

        p.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_during_bootstrap_retries() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let p = propagator(store);
        let runner = spawn_run(&p);
        tokio::time::sleep(Duration::from_millis(30)).await;

        p.cancel();
        tokio::time::timeout(Duration::from_secs(3), runner)
            .await
            .expect("run did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(p.state(), PropagatorState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_with_backlog() {
        let store = Arc::new(MemoryStore::new());
        let layout = layout();
        let mut map = BTreeMap::new();
        for i in 0..8u8 {
            let subnet = Ipv4Addr::new(10, 244, 10 + i, 0);
            let host = format!("node-{}", i);
            store
                .set(&layout.record(&host, subnet), &format!("10.244.{}.10", 10 + i))
                .await
                .unwrap();
            map.insert(subnet.to_string(), host);
        }
        store
            .set(&layout.maps(), &serde_json::to_string(&map).unwrap())
            .await
            .unwrap();

        let p = Arc::new(
            Propagator::new(store, layout, "node-a", Arc::new(SlowInventory), Arc::new(MemoryFastPath::new()))
                .with_backoff(Backoff::new(Duration::from_millis(5), Duration::from_millis(20)))
                .with_event_buffer(1),
        );
        let runner = spawn_run(&p);
        while p.state() != PropagatorState::Watching {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Resyncs for all nine subscriptions queue behind a one-slot channel
        tokio::time::sleep(Duration::from_millis(50)).await;

        p.cancel();
        tokio::time::timeout(Duration::from_secs(3), runner)
            .await
            .expect("run did not stop after cancel")
            .unwrap()
            .unwrap();
        assert_eq!(p.state(), PropagatorState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_before_run() {
        let store = Arc::new(MemoryStore::new());
        let p = propagator(store);
        p.cancel();
        p.run().await.unwrap();
        assert_eq!(p.state(), PropagatorState::Cancelled);
    }
}
