use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::header::AUTHORIZATION;
use serde::de::DeserializeOwned;

use super::InventoryProvider;
use crate::error::{Error, Result};
use crate::types::{Envelope, NetworkInterface, Node, VmConfig, VmSummary};

/// Proxmox VE API client authenticated with an API token.
pub struct ProxmoxClient {
    http: reqwest::Client,
    base_url: String,
    auth_header: String,
}

impl ProxmoxClient {
    /// `api_token` is the `USER@REALM!TOKENID=SECRET` string.
    pub fn new(
        base_url: &str,
        api_token: &str,
        timeout: Duration,
        tls_insecure: bool,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("proxdns/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .danger_accept_invalid_certs(tls_insecure)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_header: format!("PVEAPIToken={}", api_token),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api2/json/{}", self.base_url, path)
    }

    async fn fetch<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        debug!("GET {}", url);
        let resp = self
            .http
            .get(&url)
            .header(AUTHORIZATION, &self.auth_header)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Status { url, status });
        }

        let body = resp.bytes().await?;
        let envelope: Envelope<T> =
            serde_json::from_slice(&body).map_err(|source| Error::Decode { url, source })?;
        Ok(envelope.data)
    }
}

#[async_trait]
impl InventoryProvider for ProxmoxClient {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.fetch("nodes").await
    }

    async fn list_vms(&self, node: &str) -> Result<Vec<VmSummary>> {
        self.fetch(&format!("nodes/{}/qemu", node)).await
    }

    async fn vm_config(&self, node: &str, vmid: u32) -> Result<VmConfig> {
        self.fetch(&format!("nodes/{}/qemu/{}/config", node, vmid))
            .await
    }

    async fn node_network(&self, node: &str) -> Result<Vec<NetworkInterface>> {
        self.fetch(&format!("nodes/{}/network", node)).await
    }
}
