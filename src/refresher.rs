//! Periodic discovery of DNS records from the inventory.
//!
//! Each cycle walks nodes → VMs → VM configuration (and optionally the
//! node's own network interfaces), derives `label + suffix → address`
//! records and applies them to the [`RecordStore`] in a single update.
//!
//! Failures are scoped: a failed node list aborts the cycle and leaves the
//! store untouched, a failed VM list skips that node, a failed VM config
//! skips that VM and a failed network listing skips only the node record.
//! Within one cycle the last write wins, in the order the inventory
//! returned nodes, VMs and tags.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::inventory::InventoryProvider;
use crate::store::{RecordPolicy, RecordStore, Records};

#[derive(Debug, Clone)]
pub struct RefreshSettings {
    /// Appended verbatim to every derived label, e.g. `.lan.`.
    pub suffix: String,
    pub interval: Duration,
    pub use_tags: bool,
    pub use_network: bool,
    /// Interface whose address names the node itself.
    pub interface: String,
    pub policy: RecordPolicy,
}

impl From<&Config> for RefreshSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            suffix: cfg.dns_suffix.clone(),
            interval: Duration::from_secs(cfg.refresh_interval),
            use_tags: cfg.use_proxmox_tags,
            use_network: cfg.use_network_discovery,
            interface: cfg.network_interface.clone(),
            policy: cfg.record_policy,
        }
    }
}

/// Counters of one refresh cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub nodes: usize,
    pub nodes_skipped: usize,
    pub vms: usize,
    pub vms_skipped: usize,
    pub records: usize,
}

pub struct Refresher {
    provider: Arc<dyn InventoryProvider>,
    store: RecordStore,
    settings: RefreshSettings,
}

impl Refresher {
    pub fn new(
        provider: Arc<dyn InventoryProvider>,
        store: RecordStore,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            provider,
            store,
            settings,
        }
    }

    /// Refresh immediately, then again `interval` after each cycle ends,
    /// until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            "Refreshing records every {}s ({:?} policy)",
            self.settings.interval.as_secs(),
            self.settings.policy
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                res = self.refresh_once() => {
                    if let Err(e) = res {
                        error!("Error fetching node list: {}. Keeping previous records.", e);
                    }
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.settings.interval) => {}
            }
        }
        info!("Refresher stopped");
    }

    /// Run one cycle and apply its records.  Only a failure to list the
    /// nodes is returned; the store is not touched in that case.
    pub async fn refresh_once(&self) -> Result<RefreshReport> {
        let (records, report) = self.collect().await?;
        self.store.apply(self.settings.policy, records).await;
        info!(
            "Updated records: {} derived from {} VMs on {} nodes ({} nodes, {} VMs skipped), {} in store",
            report.records,
            report.vms,
            report.nodes,
            report.nodes_skipped,
            report.vms_skipped,
            self.store.len().await
        );
        if self.store.is_empty().await {
            warn!("No records in store; every query will be forwarded upstream");
        }
        debug!("Records: {:?}", self.store.snapshot().await);
        Ok(report)
    }

    async fn collect(&self) -> Result<(Records, RefreshReport)> {
        let nodes = self.provider.list_nodes().await?;
        let mut records = Records::new();
        let mut report = RefreshReport {
            nodes: nodes.len(),
            ..Default::default()
        };

        for node in &nodes {
            let name = node.node.as_str();
            match self.provider.list_vms(name).await {
                Ok(vms) => {
                    for vm in vms {
                        let config = match self.provider.vm_config(name, vm.vmid).await {
                            Ok(config) => config,
                            Err(e) => {
                                warn!(
                                    "Error fetching configuration for VM {} on node {}: {}. Skipping this VM.",
                                    vm.vmid, name, e
                                );
                                report.vms_skipped += 1;
                                continue;
                            }
                        };
                        report.vms += 1;

                        let Some(ip) = extract_ipv4(&config.ipconfig0) else {
                            debug!("VM {} on node {} has no static IPv4 address", vm.vmid, name);
                            continue;
                        };
                        if !config.name.is_empty() {
                            self.insert(&mut records, &config.name, ip);
                        }
                        if self.settings.use_tags {
                            for tag in normalize_tags(&vm.tags) {
                                self.insert(&mut records, &tag, ip);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("Error fetching VMs for node {}: {}. Skipping this node.", name, e);
                    report.nodes_skipped += 1;
                }
            }

            if self.settings.use_network {
                match self.provider.node_network(name).await {
                    Ok(ifaces) => {
                        let addr = ifaces
                            .iter()
                            .find(|i| i.iface == self.settings.interface)
                            .and_then(|i| parse_ipv4(&i.address));
                        if let Some(ip) = addr {
                            self.insert(&mut records, name, ip);
                        }
                    }
                    Err(e) => {
                        warn!("Error fetching network for node {}: {}. Skipping node record.", name, e);
                    }
                }
            }
        }

        report.records = records.len();
        Ok((records, report))
    }

    fn insert(&self, records: &mut Records, label: &str, ip: Ipv4Addr) {
        let fqdn = format!("{}{}", label, self.settings.suffix);
        if let Some(prev) = records.insert(fqdn.clone(), ip) {
            if prev != ip {
                debug!("{} overwritten: {} -> {}", fqdn, prev, ip);
            }
        }
    }
}

/// The address of the `ip=` entry of an address configuration such as
/// `ip=10.0.5.62/24,gw=10.0.5.1`.  `ip=dhcp` and malformed addresses yield
/// `None`.
pub fn extract_ipv4(ipconfig: &str) -> Option<Ipv4Addr> {
    ipconfig
        .split(',')
        .filter_map(|kv| kv.split_once('='))
        .find(|(key, _)| key.trim() == "ip")
        .and_then(|(_, value)| parse_ipv4(value))
}

/// Parse `A.B.C.D` or `A.B.C.D/prefix`.
fn parse_ipv4(value: &str) -> Option<Ipv4Addr> {
    let addr = value.split('/').next().unwrap_or_default().trim();
    addr.parse().ok()
}

/// Split a `;` separated tag string into trimmed, lowercased, non-empty tags.
pub fn normalize_tags(tags: &str) -> impl Iterator<Item = String> + '_ {
    tags.split(';')
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
}
