use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{bail, Context, Result};
use shared::protocol::{DEFAULT_DNS_PORT, DEFAULT_SRV_PRIORITY, DEFAULT_SRV_WEIGHT, DEFAULT_TTL};
use shared::types::ServiceRecord;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub publisher: PublisherConfig,
    pub dns: DnsConfig,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub mdns: MdnsConfig,
    /// Statically declared services, published for the lifetime of the daemon
    #[serde(default)]
    pub services: Vec<ServiceRecord>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublisherConfig {
    pub zone: String,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    #[serde(default = "default_srv_priority")]
    pub srv_priority: u16,
    #[serde(default = "default_srv_weight")]
    pub srv_weight: u16,
    #[serde(default = "default_sleep_interval")]
    pub sleep_interval_secs: u64,
    #[serde(default = "default_max_dns_response_time")]
    pub max_dns_response_time_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsConfig {
    pub server: IpAddr,
    #[serde(default = "default_dns_port")]
    pub port: u16,
    pub tsig_key_name: Option<String>,
    /// Hex-encoded HMAC-SHA256 secret
    pub tsig_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    #[serde(default = "default_true")]
    pub publish: bool,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MdnsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Only mirror services announced by this host
    #[serde(default = "default_true")]
    pub local_only: bool,
}

/// Pre-shared key used to sign updates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsigKey {
    pub name: String,
    pub secret: Vec<u8>,
}

fn default_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .ok()
        .and_then(|h| h.split('.').next().map(str::to_string))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_ttl() -> u32 {
    DEFAULT_TTL
}

fn default_srv_priority() -> u16 {
    DEFAULT_SRV_PRIORITY
}

fn default_srv_weight() -> u16 {
    DEFAULT_SRV_WEIGHT
}

fn default_sleep_interval() -> u64 {
    60
}

fn default_max_dns_response_time() -> u64 {
    10
}

fn default_dns_port() -> u16 {
    DEFAULT_DNS_PORT
}

fn default_true() -> bool {
    true
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            publish: true,
            ipv4: None,
            ipv6: None,
        }
    }
}

impl Default for MdnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            local_only: true,
        }
    }
}

/// Renewal period for a record with the given TTL: two thirds of it, rounded down
pub fn lease_time(ttl: u32) -> u32 {
    (u64::from(ttl) * 2 / 3) as u32
}

impl PublisherConfig {
    #[cfg(test)]
    pub fn new(zone: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            zone: zone.into(),
            hostname: hostname.into(),
            ttl: default_ttl(),
            srv_priority: default_srv_priority(),
            srv_weight: default_srv_weight(),
            sleep_interval_secs: default_sleep_interval(),
            max_dns_response_time_secs: default_max_dns_response_time(),
        }
    }

    /// Always derived from the current TTL
    pub fn lease_time(&self) -> u32 {
        lease_time(self.ttl)
    }

    /// Name the host's own address records are published under
    pub fn target(&self) -> String {
        format!("{}.{}", self.hostname, self.zone)
    }

    pub fn sleep_interval(&self) -> Duration {
        Duration::from_secs(self.sleep_interval_secs)
    }

    pub fn max_dns_response_time(&self) -> Duration {
        Duration::from_secs(self.max_dns_response_time_secs)
    }
}

impl DnsConfig {
    pub fn server_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server, self.port)
    }

    pub fn tsig_key(&self) -> Result<Option<TsigKey>> {
        match (&self.tsig_key_name, &self.tsig_secret) {
            (None, None) => Ok(None),
            (Some(name), Some(secret)) => {
                let secret = hex::decode(secret.trim())
                    .with_context(|| format!("Invalid hex secret for TSIG key {}", name))?;
                Ok(Some(TsigKey { name: name.clone(), secret }))
            }
            (Some(name), None) => bail!("TSIG key {} has no secret", name),
            (None, Some(_)) => bail!("tsig_secret given without tsig_key_name"),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(contents)?;
        config.validate()?;

        let hostname = config.publisher.hostname.clone();
        config.services = config
            .services
            .into_iter()
            .map(|s| s.with_expanded_name(&hostname))
            .collect();

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.publisher.zone.trim_matches('.').is_empty() {
            bail!("publisher.zone must not be empty");
        }
        if self.publisher.ttl == 0 {
            bail!("publisher.ttl must be positive");
        }
        if self.publisher.sleep_interval_secs == 0 {
            bail!("publisher.sleep_interval_secs must be positive");
        }
        self.dns.tsig_key()?;

        for service in &self.services {
            if service.service_type().is_empty() {
                bail!("service {:?} has no type", service.name());
            }
            if service.port() == 0 {
                bail!("service {:?} has no port", service.name());
            }
        }
        Ok(())
    }
}
