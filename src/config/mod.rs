use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::common::{Error, Result};

/// Upstream SOCKS5 endpoint (RFC 1928, no-auth).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SocksEndpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for SocksEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Logging section; consumed by the binary only, the library never installs
/// a subscriber.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Everything the core recognizes. Only the SOCKS5 endpoint is mandatory;
/// each knob carries the documented default.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub socks: SocksEndpoint,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Drop ingress packets whose IPv4 header checksum does not validate.
    /// Off by default: the tunnel has already validated them on most stacks.
    #[serde(default)]
    pub verify_ipv4_checksum: bool,

    #[serde(default = "default_time_wait_timeout_ms")]
    pub time_wait_timeout_ms: u64,

    #[serde(default = "default_handshake_timeout_ms")]
    pub socks5_handshake_timeout_ms: u64,

    #[serde(default = "default_dns_timeout_ms")]
    pub dns_timeout_ms: u64,

    #[serde(default = "default_eviction_tick_ms")]
    pub eviction_tick_ms: u64,

    #[serde(default = "default_tunnel_mtu")]
    pub tunnel_mtu: usize,
}

fn default_idle_timeout_ms() -> u64 {
    120_000
}

fn default_time_wait_timeout_ms() -> u64 {
    30_000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_dns_timeout_ms() -> u64 {
    5_000
}

fn default_eviction_tick_ms() -> u64 {
    15_000
}

fn default_tunnel_mtu() -> usize {
    1500
}

impl Config {
    /// Defaults with the given SOCKS5 endpoint; the form tests and embedders
    /// start from.
    pub fn with_socks(host: impl Into<String>, port: u16) -> Self {
        Self {
            socks: SocksEndpoint {
                host: host.into(),
                port,
            },
            log: LogConfig::default(),
            verify_ipv4_checksum: false,
            idle_timeout_ms: default_idle_timeout_ms(),
            time_wait_timeout_ms: default_time_wait_timeout_ms(),
            socks5_handshake_timeout_ms: default_handshake_timeout_ms(),
            dns_timeout_ms: default_dns_timeout_ms(),
            eviction_tick_ms: default_eviction_tick_ms(),
            tunnel_mtu: default_tunnel_mtu(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_yml::from_str(&content)
            .map_err(|e| Error::Config(format!("cannot parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.socks.host.is_empty() {
            return Err(Error::Config("socks.host must not be empty".into()));
        }
        if self.socks.port == 0 {
            return Err(Error::Config("socks.port must not be zero".into()));
        }
        if self.tunnel_mtu < 576 || self.tunnel_mtu > 65535 {
            return Err(Error::Config(format!(
                "tunnel_mtu {} outside 576..=65535",
                self.tunnel_mtu
            )));
        }
        if self.eviction_tick_ms == 0 {
            return Err(Error::Config("eviction_tick_ms must not be zero".into()));
        }
        if self.socks5_handshake_timeout_ms == 0 || self.dns_timeout_ms == 0 {
            return Err(Error::Config("timeouts must not be zero".into()));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn time_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.time_wait_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.socks5_handshake_timeout_ms)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms)
    }

    pub fn eviction_tick(&self) -> Duration {
        Duration::from_millis(self.eviction_tick_ms)
    }

    /// A commented sample configuration carrying every default.
    pub fn sample_yaml() -> String {
        r#"# tunsocks configuration

# Upstream SOCKS5 proxy (RFC 1928, no authentication). Required.
socks:
  host: 127.0.0.1
  port: 1080

log:
  level: info

# Connections idle longer than this are evicted.
idle_timeout_ms: 120000

# TCP flows linger this long in TIME_WAIT after an orderly close.
time_wait_timeout_ms: 30000

# Read deadline for SOCKS5 greeting / CONNECT / ASSOCIATE replies.
socks5_handshake_timeout_ms: 10000

# Read deadline for a DNS-over-TCP response on the port-53 fast path.
dns_timeout_ms: 5000

# How often the eviction pass runs.
eviction_tick_ms: 15000

# Read buffer size; one tunnel datagram must fit.
tunnel_mtu: 1500

# Drop ingress packets with a bad IPv4 header checksum.
verify_ipv4_checksum: false
"#
        .to_string()
    }
}
