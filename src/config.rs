use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::store::RecordPolicy;

/// Environment variables read without the `PROXDNS_` prefix.
const BARE_ENV_KEYS: &[&str] = &[
    "proxmox_url",
    "pve_api_token",
    "dns_suffix",
    "dns_port",
    "refresh_interval",
    "use_proxmox_tags",
    "use_network_discovery",
];

#[derive(Clone, Deserialize, Serialize)]
pub struct Config {
    /// Base URL of the Proxmox API, e.g. `https://pve.example.com:8006`.
    pub proxmox_url: String,
    /// `USER@REALM!TOKENID=SECRET`.
    pub pve_api_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pve_api_token_file: Option<String>,
    /// Appended to every derived name, e.g. `.lan.`.
    pub dns_suffix: String,
    pub bind_ip: IpAddr,
    pub dns_port: u16,
    pub enable_tcp: bool,
    /// Seconds.
    pub tcp_timeout: u64,
    pub upstream: SocketAddr,
    /// Seconds.
    pub upstream_timeout: u64,
    /// Seconds.
    pub refresh_interval: u64,
    pub use_proxmox_tags: bool,
    pub use_network_discovery: bool,
    pub network_interface: String,
    pub record_policy: RecordPolicy,
    /// Accept self-signed Proxmox certificates.
    pub tls_insecure: bool,
    /// Seconds.
    pub http_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxmox_url: String::new(),
            pve_api_token: String::new(),
            pve_api_token_file: None,
            dns_suffix: String::new(),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dns_port: 2053,
            enable_tcp: true,
            tcp_timeout: 10,
            upstream: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53),
            upstream_timeout: 2,
            refresh_interval: 60,
            use_proxmox_tags: false,
            use_network_discovery: false,
            network_interface: "vmbr0".into(),
            record_policy: RecordPolicy::default(),
            tls_insecure: false,
            http_timeout: 30,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("proxmox_url", &self.proxmox_url)
            .field("pve_api_token", &"<redacted>")
            .field("dns_suffix", &self.dns_suffix)
            .field("dns_bind", &self.dns_bind())
            .field("enable_tcp", &self.enable_tcp)
            .field("upstream", &self.upstream)
            .field("upstream_timeout", &self.upstream_timeout)
            .field("refresh_interval", &self.refresh_interval)
            .field("use_proxmox_tags", &self.use_proxmox_tags)
            .field("use_network_discovery", &self.use_network_discovery)
            .field("network_interface", &self.network_interface)
            .field("record_policy", &self.record_policy)
            .field("tls_insecure", &self.tls_insecure)
            .finish()
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(Self::figment())
    }

    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("proxdns.toml"))
            .merge(Json::file("proxdns.json"))
            .merge(Env::raw().only(BARE_ENV_KEYS))
            .merge(Env::prefixed("PROXDNS_"))
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Some(ref secret_file) = config.pve_api_token_file {
            config.pve_api_token = std::fs::read_to_string(secret_file)
                .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", secret_file, e))?
                .trim()
                .to_string();
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> anyhow::Result<()> {
        if self.proxmox_url.is_empty() || self.pve_api_token.is_empty() {
            anyhow::bail!("PROXMOX_URL and/or PVE_API_TOKEN are not set");
        }
        if self.dns_suffix.is_empty() {
            anyhow::bail!("DNS_SUFFIX is not set");
        }
        if self.refresh_interval == 0 {
            anyhow::bail!("refresh_interval must be at least 1 second");
        }
        if self.upstream_timeout == 0 {
            anyhow::bail!("upstream_timeout must be at least 1 second");
        }

        self.proxmox_url = self.proxmox_url.trim_end_matches('/').to_string();
        self.dns_suffix = self.dns_suffix.to_ascii_lowercase();
        if !self.dns_suffix.ends_with('.') {
            warn!(
                "DNS suffix {:?} is not fully qualified, using {:?}",
                self.dns_suffix,
                format!("{}.", self.dns_suffix)
            );
            self.dns_suffix.push('.');
        }
        Ok(())
    }

    pub fn dns_bind(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.dns_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn load() -> anyhow::Result<Config> {
        Config::from_figment(Config::figment())
    }

    #[test]
    fn test_defaults_with_required_env() {
        Jail::expect_with(|jail| {
            jail.set_env("PROXMOX_URL", "https://pve:8006/");
            jail.set_env("PVE_API_TOKEN", "root@pam!dns=secret");
            jail.set_env("DNS_SUFFIX", ".LAN.");

            let cfg = load().unwrap();
            assert_eq!(cfg.proxmox_url, "https://pve:8006");
            assert_eq!(cfg.dns_suffix, ".lan.");
            assert_eq!(cfg.dns_bind(), "0.0.0.0:2053".parse().unwrap());
            assert_eq!(cfg.upstream, "8.8.8.8:53".parse().unwrap());
            assert_eq!(cfg.refresh_interval, 60);
            assert!(!cfg.use_proxmox_tags);
            assert!(!cfg.use_network_discovery);
            assert_eq!(cfg.record_policy, RecordPolicy::Replace);
            Ok(())
        });
    }

    #[test]
    fn test_missing_required_settings() {
        Jail::expect_with(|jail| {
            jail.set_env("PROXMOX_URL", "https://pve:8006");
            assert!(load().is_err());

            jail.set_env("PVE_API_TOKEN", "root@pam!dns=secret");
            let err = load().unwrap_err();
            assert!(err.to_string().contains("DNS_SUFFIX"));
            Ok(())
        });
    }

    #[test]
    fn test_file_and_prefixed_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "proxdns.toml",
                r#"
                    proxmox_url = "https://pve:8006"
                    pve_api_token = "root@pam!dns=secret"
                    dns_suffix = "home.arpa"
                    record_policy = "merge"
                    dns_port = 5353
                "#,
            )?;
            jail.set_env("DNS_PORT", "5300");
            jail.set_env("USE_PROXMOX_TAGS", "true");
            jail.set_env("PROXDNS_DNS_PORT", "53");
            jail.set_env("PROXDNS_UPSTREAM", "1.1.1.1:53");

            let cfg = load().unwrap();
            assert_eq!(cfg.dns_suffix, "home.arpa.");
            assert_eq!(cfg.record_policy, RecordPolicy::Merge);
            assert_eq!(cfg.dns_port, 53);
            assert!(cfg.use_proxmox_tags);
            assert_eq!(cfg.upstream, "1.1.1.1:53".parse().unwrap());
            Ok(())
        });
    }

    #[test]
    fn test_token_from_file() {
        Jail::expect_with(|jail| {
            jail.create_file("token", "root@pam!dns=from-file\n")?;
            jail.set_env("PROXMOX_URL", "https://pve:8006");
            jail.set_env("DNS_SUFFIX", ".lan.");
            jail.set_env("PROXDNS_PVE_API_TOKEN_FILE", "token");

            let cfg = load().unwrap();
            assert_eq!(cfg.pve_api_token, "root@pam!dns=from-file");
            assert!(!format!("{:?}", cfg).contains("from-file"));
            Ok(())
        });
    }

    #[test]
    fn test_zero_interval_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("PROXMOX_URL", "https://pve:8006");
            jail.set_env("PVE_API_TOKEN", "root@pam!dns=secret");
            jail.set_env("DNS_SUFFIX", ".lan.");
            jail.set_env("REFRESH_INTERVAL", "0");
            assert!(load().is_err());
            Ok(())
        });
    }
}
