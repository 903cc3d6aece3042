//! Kubernetes API server inventory
//!
//! Reads `GET /api/v1/nodes/{name}` with a client certificate and picks the
//! `InternalIP` entry of `status.addresses`.

use super::NodeInventory;
use crate::common::{Error, InventoryConfig, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct Node {
    #[serde(default)]
    status: NodeStatus,
}

#[derive(Debug, Default, Deserialize)]
struct NodeStatus {
    #[serde(default)]
    addresses: Vec<NodeAddress>,
}

#[derive(Debug, Deserialize)]
struct NodeAddress {
    #[serde(rename = "type")]
    kind: String,
    address: String,
}

pub struct KubeInventory {
    client: reqwest::Client,
    api_server: String,
}

impl KubeInventory {
    pub async fn from_config(config: &InventoryConfig) -> Result<Self> {
        let api_server = config
            .api_server
            .clone()
            .ok_or_else(|| Error::InvalidConfig("inventory.api_server is not set".into()))?;

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(10));
        if let Some(ca) = &config.ca_cert {
            let pem = tokio::fs::read(ca).await?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        if let (Some(cert), Some(key)) = (&config.cert, &config.key) {
            let mut pem = tokio::fs::read(cert).await?;
            pem.extend(tokio::fs::read(key).await?);
            builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
        }

        Ok(Self {
            client: builder.build()?,
            api_server: api_server.trim_end_matches('/').to_string(),
        })
    }

    fn node_url(&self, hostname: &str) -> String {
        format!("{}/api/v1/nodes/{}", self.api_server, hostname)
    }
}

#[async_trait]
impl NodeInventory for KubeInventory {
    async fn internal_ip(&self, hostname: &str) -> Result<Ipv4Addr> {
        let resp = self.client.get(self.node_url(hostname)).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NodeNotFound(hostname.to_string()));
        }
        let node: Node = resp.error_for_status()?.json().await?;
        internal_ip_of(&node).ok_or_else(|| Error::NodeNotFound(hostname.to_string()))
    }
}

fn internal_ip_of(node: &Node) -> Option<Ipv4Addr> {
    node.status
        .addresses
        .iter()
        .filter(|a| a.kind == "InternalIP")
        .find_map(|a| a.address.parse().ok())
}
