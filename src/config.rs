use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub dhcp: DhcpConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpConfig {
    pub interface: String,
    pub server_ip: Ipv4Addr,
    pub start_addr: Ipv4Addr,
    pub end_addr: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub router: Ipv4Addr,
    #[serde(default)]
    pub domain_name: String,
    #[serde(default)]
    pub name_servers: Vec<Ipv4Addr>,
    pub lease_ttl_seconds: u32,
    /// Static bindings, client MAC to address. The address may live outside
    /// the dynamic pool range.
    #[serde(default)]
    pub reserved_addresses: HashMap<String, Ipv4Addr>,
    pub lease_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "default_dns_port")]
    pub port: u16,
    #[serde(default = "default_upstreams")]
    pub upstream_servers: Vec<Ipv4Addr>,
    /// Hosts-file blocklist sources, HTTP URLs or filesystem paths.
    #[serde(default)]
    pub block_lists: Vec<String>,
    #[serde(default)]
    pub blocked_domains: Vec<String>,
    #[serde(default)]
    pub local_domains: HashMap<String, Ipv4Addr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_web_address")]
    pub address: String,
    #[serde(default)]
    pub htpasswd_file: Option<String>,
}

fn default_dns_port() -> u16 {
    53
}

fn default_upstreams() -> Vec<Ipv4Addr> {
    vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(9, 9, 9, 9)]
}

fn default_web_address() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            server_ip: Ipv4Addr::new(192, 168, 1, 1),
            start_addr: Ipv4Addr::new(192, 168, 1, 100),
            end_addr: Ipv4Addr::new(192, 168, 1, 200),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            router: Ipv4Addr::new(192, 168, 1, 1),
            domain_name: "lan".to_string(),
            name_servers: vec![Ipv4Addr::new(192, 168, 1, 1)],
            lease_ttl_seconds: 86400,
            reserved_addresses: HashMap::new(),
            lease_file: "leases.bin".to_string(),
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            port: default_dns_port(),
            upstream_servers: default_upstreams(),
            block_lists: Vec::new(),
            blocked_domains: Vec::new(),
            local_domains: HashMap::new(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            address: default_web_address(),
            htpasswd_file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dhcp: DhcpConfig::default(),
            dns: DnsConfig::default(),
            web: WebConfig::default(),
        }
    }
}

impl Config {
    pub async fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.dhcp.validate()?;
        self.dns.validate()?;
        Ok(())
    }
}

impl DhcpConfig {
    pub fn validate(&self) -> Result<()> {
        let start = u32::from(self.start_addr);
        let end = u32::from(self.end_addr);

        if start > end {
            return Err(Error::InvalidConfig(
                "start_addr must be less than or equal to end_addr".to_string(),
            ));
        }

        let server = u32::from(self.server_ip);
        if server >= start && server <= end {
            return Err(Error::InvalidConfig(
                "server_ip must not be within the pool range".to_string(),
            ));
        }

        if !Self::is_valid_subnet_mask(self.subnet_mask) {
            return Err(Error::InvalidConfig(format!(
                "invalid subnet mask: {} (must be contiguous)",
                self.subnet_mask
            )));
        }

        if self.lease_ttl_seconds == 0 {
            return Err(Error::InvalidConfig(
                "lease_ttl_seconds must be greater than 0".to_string(),
            ));
        }

        let mut seen_ips: HashSet<Ipv4Addr> = HashSet::new();
        let mut seen_macs: HashSet<String> = HashSet::new();

        for (mac, ip) in &self.reserved_addresses {
            if !Self::is_valid_mac(mac) {
                return Err(Error::InvalidConfig(format!(
                    "invalid MAC address format: {}",
                    mac
                )));
            }

            if !seen_macs.insert(normalize_mac(mac)) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate MAC address in reservations: {}",
                    mac
                )));
            }

            if !seen_ips.insert(*ip) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate IP address in reservations: {}",
                    ip
                )));
            }
        }

        Ok(())
    }

    fn is_valid_subnet_mask(mask: Ipv4Addr) -> bool {
        let mask_bits = u32::from(mask);
        if mask_bits == 0 {
            return false;
        }
        let inverted = !mask_bits;
        inverted.count_ones() == inverted.trailing_ones()
    }

    pub fn ip_in_pool(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        addr >= u32::from(self.start_addr) && addr <= u32::from(self.end_addr)
    }

    pub fn pool_size(&self) -> u32 {
        u32::from(self.end_addr) - u32::from(self.start_addr) + 1
    }

    /// Directed broadcast for the served subnet, `addr | !mask`.
    pub fn broadcast_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.server_ip) | !u32::from(self.subnet_mask))
    }

    pub fn is_valid_mac(mac: &str) -> bool {
        let normalized = normalize_mac(mac);
        let parts: Vec<&str> = normalized.split(':').collect();
        parts.len() == 6
            && parts
                .iter()
                .all(|part| part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit()))
    }
}

impl DnsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.upstream_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one upstream server is required".to_string(),
            ));
        }

        for (domain, ip) in &self.local_domains {
            if domain.is_empty() {
                return Err(Error::InvalidConfig(
                    "local domain name must not be empty".to_string(),
                ));
            }
            if *ip == Ipv4Addr::UNSPECIFIED {
                return Err(Error::InvalidConfig(format!(
                    "local domain {} maps to the zero address",
                    domain
                )));
            }
        }

        Ok(())
    }
}

pub fn normalize_mac(mac: &str) -> String {
    mac.to_lowercase().replace('-', ":")
}

pub fn sanitize_hostname(hostname: &str) -> String {
    hostname
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
        .take(255)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(Config::default().validate().is_ok());

        let invalid_dhcp_configs = [
            DhcpConfig {
                start_addr: Ipv4Addr::new(192, 168, 1, 200),
                end_addr: Ipv4Addr::new(192, 168, 1, 100),
                ..Default::default()
            },
            DhcpConfig {
                server_ip: Ipv4Addr::new(192, 168, 1, 150),
                ..Default::default()
            },
            DhcpConfig {
                lease_ttl_seconds: 0,
                ..Default::default()
            },
            DhcpConfig {
                subnet_mask: Ipv4Addr::new(255, 0, 255, 0),
                ..Default::default()
            },
            DhcpConfig {
                reserved_addresses: HashMap::from([(
                    "invalid".to_string(),
                    Ipv4Addr::new(192, 168, 1, 50),
                )]),
                ..Default::default()
            },
        ];
        for config in invalid_dhcp_configs {
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_subnet_mask_validation() {
        assert!(DhcpConfig::is_valid_subnet_mask(Ipv4Addr::new(
            255, 255, 255, 0
        )));
        assert!(DhcpConfig::is_valid_subnet_mask(Ipv4Addr::new(
            255, 255, 240, 0
        )));
        assert!(DhcpConfig::is_valid_subnet_mask(Ipv4Addr::new(255, 0, 0, 0)));
        assert!(!DhcpConfig::is_valid_subnet_mask(Ipv4Addr::new(
            255, 0, 255, 0
        )));
        assert!(!DhcpConfig::is_valid_subnet_mask(Ipv4Addr::new(0, 0, 0, 0)));
    }

    #[test]
    fn test_dns_validation() {
        let no_upstreams = DnsConfig {
            upstream_servers: vec![],
            ..Default::default()
        };
        assert!(no_upstreams.validate().is_err());

        let zero_local = DnsConfig {
            local_domains: HashMap::from([(
                "printer.lan".to_string(),
                Ipv4Addr::UNSPECIFIED,
            )]),
            ..Default::default()
        };
        assert!(zero_local.validate().is_err());
    }

    #[test]
    fn test_pool_functions() {
        let config = DhcpConfig::default();

        assert!(config.ip_in_pool(Ipv4Addr::new(192, 168, 1, 100)));
        assert!(config.ip_in_pool(Ipv4Addr::new(192, 168, 1, 200)));
        assert!(!config.ip_in_pool(Ipv4Addr::new(192, 168, 1, 50)));
        assert!(!config.ip_in_pool(Ipv4Addr::new(10, 0, 0, 1)));

        assert_eq!(config.pool_size(), 101);
        assert_eq!(config.broadcast_addr(), Ipv4Addr::new(192, 168, 1, 255));
    }

    #[test]
    fn test_mac_functions() {
        assert_eq!(normalize_mac("AA-BB-CC-DD-EE-FF"), "aa:bb:cc:dd:ee:ff");

        assert!(DhcpConfig::is_valid_mac("aa:bb:cc:dd:ee:ff"));
        assert!(DhcpConfig::is_valid_mac("AA-BB-CC-DD-EE-FF"));
        assert!(!DhcpConfig::is_valid_mac("invalid"));
        assert!(!DhcpConfig::is_valid_mac(""));
    }

    #[test]
    fn test_sanitize_hostname() {
        assert_eq!(sanitize_hostname("valid-host.local"), "valid-host.local");
        assert_eq!(sanitize_hostname("bad\x00host"), "badhost");
        assert_eq!(sanitize_hostname("has spaces"), "hasspaces");
    }

    #[test]
    fn test_duplicate_reserved_ip() {
        let config = DhcpConfig {
            reserved_addresses: HashMap::from([
                (
                    "aa:bb:cc:dd:ee:01".to_string(),
                    Ipv4Addr::new(192, 168, 1, 50),
                ),
                (
                    "aa:bb:cc:dd:ee:02".to_string(),
                    Ipv4Addr::new(192, 168, 1, 50),
                ),
            ]),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
