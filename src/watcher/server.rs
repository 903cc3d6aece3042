//! Watcher daemon

use super::fastpath::MemoryFastPath;
use super::guard::InstanceGuard;
use super::health::{self, HealthState};
use super::propagator::Propagator;
use crate::common::{Backoff, Config, Result};
use crate::inventory;
use crate::ipam::{IpamOptions, IpamService};
use crate::store::{CoordinationStore, EtcdStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct WatcherDaemon {
    config: Config,
    hostname: String,
}

impl WatcherDaemon {
    pub fn new(config: Config, hostname: String) -> Self {
        Self { config, hostname }
    }

    /// Run until `cancel` fires. Refuses to start when another instance holds the lock.
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let watcher = &self.config.watcher;
        tracing::info!("Starting watcher on {}", self.hostname);
        tracing::info!("  Store: {}", self.config.store.endpoints.join(","));
        tracing::info!("  Cluster subnet: {}", self.config.ipam.subnet);
        tracing::info!("  Lock file: {}", watcher.lock_path.display());

        let _guard = InstanceGuard::acquire(&watcher.lock_path)?;

        let store: Arc<dyn CoordinationStore> = Arc::new(EtcdStore::connect(&self.config.store).await?);
        let inventory = inventory::from_config(&self.config.inventory).await?;
        let ipam = IpamService::init(store, &self.hostname, IpamOptions::from_config(&self.config))
            .await?
            .with_inventory(inventory.clone());

        let table = match &watcher.snapshot_path {
            Some(path) => MemoryFastPath::with_snapshot(path),
            None => MemoryFastPath::new(),
        };
        let propagator = Arc::new(
            Propagator::for_service(&ipam, inventory, Arc::new(table))
                .with_backoff(Backoff::new(watcher.backoff_initial(), watcher.backoff_max()))
                .with_event_buffer(watcher.event_buffer)
                .with_cancel(cancel.clone()),
        );

        let health_task = watcher.health_addr.map(|addr| {
            let state = HealthState {
                propagator: propagator.clone(),
            };
            tokio::spawn(health::serve(addr, state, cancel.clone()))
        });

        tracing::info!("✓ Watcher ready (subnet {})", ipam.host_subnet());
        let result = propagator.run().await;

        // Take the endpoint down with the propagator.
        cancel.cancel();
        if let Some(task) = health_task {
            match task.await {
                Ok(Err(e)) => tracing::error!("Health endpoint error: {}", e),
                Err(e) => tracing::error!("Health endpoint task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        result
    }
}
