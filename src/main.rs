//! proxdns daemon entry point.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::signal;
use tokio_util::sync::CancellationToken;

mod config;
mod dns_server;
mod error;
mod framing;
mod inventory;
mod refresher;
mod store;
mod types;
mod upstream;

use config::Config;
use dns_server::{run_dns_server, ProxDns};
use inventory::ProxmoxClient;
use refresher::{RefreshSettings, Refresher};
use store::RecordStore;
use upstream::UdpUpstream;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting proxdns with config: {:?}", cfg);

    // Shared state
    let store = RecordStore::new();
    let shutdown = CancellationToken::new();

    // Inventory refresh
    let client = ProxmoxClient::new(
        &cfg.proxmox_url,
        &cfg.pve_api_token,
        Duration::from_secs(cfg.http_timeout),
        cfg.tls_insecure,
    )?;
    let refresher = Refresher::new(
        Arc::new(client),
        store.clone(),
        RefreshSettings::from(&cfg),
    );
    let refresh_handle = tokio::spawn(refresher.run(shutdown.clone()));

    // DNS Server
    let upstream = UdpUpstream::new(cfg.upstream, Duration::from_secs(cfg.upstream_timeout));
    info!("Forwarding unknown names to {}", upstream.addr());
    let handler = ProxDns::new(store, Arc::new(upstream));
    let tcp_timeout = cfg
        .enable_tcp
        .then(|| Duration::from_secs(cfg.tcp_timeout));
    let mut dns_handle = tokio::spawn(run_dns_server(
        cfg.dns_bind(),
        tcp_timeout,
        handler,
        shutdown.clone(),
    ));

    // Graceful Shutdown
    tokio::select! {
        res = signal::ctrl_c() => match res {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        },
        res = &mut dns_handle => {
            shutdown.cancel();
            if let Err(e) = refresh_handle.await {
                error!("Refresher task failed: {}", e);
            }
            return match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.context("DNS server failed")),
                Err(e) => Err(e.into()),
            };
        }
    }

    shutdown.cancel();
    if let Err(e) = refresh_handle.await {
        error!("Refresher task failed: {}", e);
    }
    match dns_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("DNS server failed: {:#}", e),
        Err(e) => error!("DNS server task failed: {}", e),
    }

    info!("Shutdown complete.");
    Ok(())
}
