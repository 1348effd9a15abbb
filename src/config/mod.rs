//! Configuration management

use crate::domain::ip_change::IpChangeParam;
use crate::domain::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix, e.g. `SIPREACH__STUN__TRY_IPV6=true`
pub const ENV_PREFIX: &str = "SIPREACH";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stun: StunConfig,
    pub ip_change: IpChangeConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StunConfig {
    /// Ordered `host[:port]` candidates
    pub servers: Vec<String>,
    /// Publish the local address when resolution fails instead of failing
    pub ignore_failure: bool,
    /// Retry each entry over IPv6 after IPv4 fails
    pub try_ipv6: bool,
    /// Probe IPv6 only (NAT64 deployments)
    pub nat64: bool,
    /// Per-trial timeout
    pub timeout_ms: u64,
    /// Initial binding request retransmission timeout (RFC 5389 RTO)
    pub rto_ms: u64,
    /// Run NAT type detection after the first successful resolution
    pub detect_nat_type: bool,
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            ignore_failure: true,
            try_ipv6: false,
            nat64: false,
            timeout_ms: 3000,
            rto_ms: 250,
            detect_nat_type: false,
        }
    }
}

impl StunConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn rto(&self) -> Duration {
        Duration::from_millis(self.rto_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpChangeConfig {
    pub restart_listener: bool,
    /// Delay before retrying a failed listener restart; 0 disables retry
    pub restart_retry_delay_ms: u64,
    pub restart_max_attempts: u32,
}

impl Default for IpChangeConfig {
    fn default() -> Self {
        Self {
            restart_listener: true,
            restart_retry_delay_ms: 0,
            restart_max_attempts: 3,
        }
    }
}

impl IpChangeConfig {
    pub fn param(&self) -> IpChangeParam {
        IpChangeParam {
            restart_listener: self.restart_listener,
            restart_retry_delay: Duration::from_millis(self.restart_retry_delay_ms),
            restart_max_attempts: self.restart_max_attempts.max(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads polling the event loop; 0 means the application
    /// drives the loop itself
    pub worker_threads: usize,
    pub shutdown_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 1,
            shutdown_timeout_ms: 1000,
        }
    }
}

impl Config {
    /// Load from an optional file layered under `SIPREACH__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("stun.servers")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Parse TOML text, mainly for embedding and tests
    pub fn from_toml(text: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}
