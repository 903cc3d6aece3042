//! CLI for per-host IPAM operations

use clap::{Parser, Subcommand};
use meshipam::common::local_hostname;
use meshipam::{Config, CoordinationStore, EtcdStore, IpamOptions, IpamService, MemoryStore};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "meshipam")]
#[command(about = "meshipam container IPAM CLI")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// etcd endpoints (comma-separated)
    #[arg(long, value_delimiter = ',')]
    endpoints: Vec<String>,

    /// Cluster subnet, optionally with /mask
    #[arg(long)]
    subnet: Option<String>,

    /// Cluster mask length
    #[arg(long)]
    mask: Option<u8>,

    /// Pod subnet mask length
    #[arg(long)]
    pod_mask: Option<u8>,

    /// Hostname to act as (defaults to the system hostname)
    #[arg(long)]
    hostname: Option<String>,

    /// Use an in-process store instead of etcd
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the pool and this host's subnet
    Init,

    /// Reserve unused addresses
    Allocate {
        /// Number of addresses
        #[arg(long, default_value = "1")]
        count: usize,
    },

    /// Release addresses
    Release {
        /// Addresses to release
        #[arg(required = true)]
        addresses: Vec<Ipv4Addr>,
    },

    /// Print the gateway address
    Gateway {
        /// Append the cluster mask
        #[arg(long)]
        with_mask: bool,
    },

    /// List addresses in use on this host
    Used,

    /// Print a host's subnet
    Subnet {
        /// Host (defaults to this one)
        host: Option<String>,
    },

    /// Print the subnet -> host map
    Map,

    /// Give this host's subnet back to the pool
    ReleaseSubnet,

    /// Delete all IPAM state in the namespace
    Clear {
        /// Confirm
        #[arg(long)]
        yes: bool,
    },
}

impl Cli {
    /// File and environment first, flags on top.
    fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;
        if !self.endpoints.is_empty() {
            config.store.endpoints = self.endpoints.clone();
        }
        if let Some(subnet) = &self.subnet {
            config.ipam.subnet = subnet.clone();
        }
        if let Some(mask) = self.mask {
            config.ipam.mask_len = mask;
        }
        if let Some(pod_mask) = self.pod_mask {
            config.ipam.pod_mask_len = Some(pod_mask);
        }
        if let Some(hostname) = &self.hostname {
            config.ipam.hostname = Some(hostname.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let hostname = match &config.ipam.hostname {
        Some(hostname) => hostname.clone(),
        None => local_hostname()?,
    };
    let store: Arc<dyn CoordinationStore> = if cli.dry_run {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(EtcdStore::connect(&config.store).await?)
    };
    let ipam = IpamService::init(store, &hostname, IpamOptions::from_config(&config)).await?;

    match cli.command {
        Commands::Init => {
            let get = ipam.get().await;
            println!("Host: {}", hostname);
            println!("  Cluster subnet: {}", get.current_subnet());
            println!("  Host subnet: {}", ipam.host_subnet());
            println!("  Gateway: {}", get.gateway_cidr().await?);
        }

        Commands::Allocate { count } => {
            let get = ipam.get().await;
            for _ in 0..count {
                println!("{}", get.unused_ip().await?);
            }
        }

        Commands::Release { addresses } => {
            ipam.release().await.ips(&addresses).await?;
            println!("Released {} address(es)", addresses.len());
        }

        Commands::Gateway { with_mask } => {
            let get = ipam.get().await;
            if with_mask {
                println!("{}", get.gateway_cidr().await?);
            } else {
                println!("{}", get.gateway().await?);
            }
        }

        Commands::Used => {
            for addr in ipam.get().await.all_used_ips().await? {
                println!("{}", addr);
            }
        }

        Commands::Subnet { host } => {
            let host = host.unwrap_or_else(|| hostname.clone());
            match ipam.get().await.cidr(&host).await? {
                Some(cidr) => println!("{}", cidr),
                None => anyhow::bail!("no subnet assigned to {}", host),
            }
        }

        Commands::Map => {
            let map = ipam.get().await.host_subnet_map().await?;
            println!("{}", serde_json::to_string_pretty(&map)?);
        }

        Commands::ReleaseSubnet => match ipam.release().await.pool().await? {
            Some(subnet) => println!("Released subnet {}", subnet),
            None => println!("No subnet assigned to {}", hostname),
        },

        Commands::Clear { yes } => {
            if !yes {
                anyhow::bail!("refusing to clear without --yes");
            }
            ipam.clear().await?;
            println!("Cleared {}", config.store.namespace);
        }
    }

    Ok(())
}
