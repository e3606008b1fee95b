use async_trait::async_trait;

use crate::error::Result;
use crate::types::{NetworkInterface, Node, VmConfig, VmSummary};

pub mod proxmox;
pub use proxmox::ProxmoxClient;

/// A source of compute nodes, their VMs and their network interfaces.
#[async_trait]
pub trait InventoryProvider: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    async fn list_vms(&self, node: &str) -> Result<Vec<VmSummary>>;

    async fn vm_config(&self, node: &str, vmid: u32) -> Result<VmConfig>;

    /// The node's own network interfaces.
    async fn node_network(&self, node: &str) -> Result<Vec<NetworkInterface>>;
}
