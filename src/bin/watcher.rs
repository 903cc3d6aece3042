//! Watcher binary

use clap::Parser;
use meshipam::common::local_hostname;
use meshipam::{Config, WatcherDaemon};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "meshipam-watcher")]
#[command(about = "Mirrors remote pod addresses into the local fast-path table")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Hostname to act as (defaults to the system hostname)
    #[arg(long)]
    hostname: Option<String>,

    /// Lock file guarding against a second instance
    #[arg(long)]
    lock: Option<PathBuf>,

    /// Health endpoint address
    #[arg(long)]
    health: Option<SocketAddr>,

    /// Fast-path snapshot file
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(lock) = cli.lock {
        config.watcher.lock_path = lock;
    }
    if let Some(health) = cli.health {
        config.watcher.health_addr = Some(health);
    }
    if let Some(snapshot) = cli.snapshot {
        config.watcher.snapshot_path = Some(snapshot);
    }
    if let Some(hostname) = cli.hostname {
        config.ipam.hostname = Some(hostname);
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let hostname = match &config.ipam.hostname {
        Some(hostname) => hostname.clone(),
        None => local_hostname()?,
    };

    let cancel = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted, shutting down"),
                _ = sigterm.recv() => tracing::info!("Terminated, shutting down"),
            }
            cancel.cancel();
        }
    });

    WatcherDaemon::new(config, hostname).serve(cancel).await?;
    Ok(())
}
