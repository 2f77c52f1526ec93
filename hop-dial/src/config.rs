//! Configuration types for the dialer

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::dns::{parse_upstream, UpstreamSpec, DEFAULT_MAX_ENTRIES, DEFAULT_UPSTREAM};
use crate::error::{Error, Result};

/// Main configuration structure
///
/// # Example Configuration
///
/// ```toml
/// [common]
/// log_level = "info"
///
/// [protect]
/// vpn_mode = true
/// path = "protect_path"
/// timeout_secs = 3
///
/// [dns]
/// override = true
/// upstream = "119.29.29.29:53"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Settings for the command line front end
    #[serde(default)]
    pub common: CommonConfig,

    /// Socket protection
    #[serde(default)]
    pub protect: ProtectConfig,

    /// Resolver override
    #[serde(default)]
    pub dns: DnsConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.protect.validate()?;
        self.dns.validate()?;
        Ok(())
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# ruhop-dial configuration

[common]
# Log level: "error", "warn", "info", "debug", "trace"
log_level = "info"

[protect]
# Protect every outbound socket before it connects (also enabled by -V)
vpn_mode = false

# Unix socket of the protector that exempts sockets from the VPN.
# Relative paths are resolved against the working directory.
path = "protect_path"

# Seconds allowed for each step of the protect exchange
timeout_secs = 3

[dns]
# Resolve host names by querying the upstream below directly instead of
# using the system resolver. The queries are protected like any other dial.
override = true

# Upstream server: "IP[:port]" or "IP[:port]/udp" (UDP, TCP on truncation),
# or "IP[:port]/tcp" (TCP only)
upstream = "119.29.29.29:53"

# Seconds allowed for one lookup
timeout_secs = 5

# Maximum number of cached answers
cache_size = 1000
"#
        .to_string()
    }
}

/// Settings only the binary uses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Socket protection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectConfig {
    /// Protect sockets before connecting
    #[serde(default)]
    pub vpn_mode: bool,

    /// Path of the protector's Unix socket
    #[serde(default = "default_protect_path")]
    pub path: String,

    /// Per-step timeout of the protect exchange in seconds
    #[serde(default = "default_protect_timeout")]
    pub timeout_secs: u64,
}

impl Default for ProtectConfig {
    fn default() -> Self {
        Self {
            vpn_mode: false,
            path: default_protect_path(),
            timeout_secs: default_protect_timeout(),
        }
    }
}

impl ProtectConfig {
    pub fn validate(&self) -> Result<()> {
        if self.path.is_empty() {
            return Err(Error::Config("protect.path must not be empty".into()));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config("protect.timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Resolver override settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Query `upstream` directly instead of using the system resolver
    #[serde(rename = "override", default = "default_true")]
    pub override_system: bool,

    /// Upstream server specification
    #[serde(default = "default_upstream")]
    pub upstream: String,

    /// Lookup timeout in seconds
    #[serde(default = "default_dns_timeout")]
    pub timeout_secs: u64,

    /// Answer cache capacity
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            override_system: true,
            upstream: default_upstream(),
            timeout_secs: default_dns_timeout(),
            cache_size: default_cache_size(),
        }
    }
}

impl DnsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(Error::Config("dns.timeout_secs must be positive".into()));
        }
        self.upstream_spec()?;
        Ok(())
    }

    /// Parsed upstream server
    pub fn upstream_spec(&self) -> Result<UpstreamSpec> {
        parse_upstream(&self.upstream)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_protect_path() -> String {
    hop_protect::DEFAULT_PROTECT_PATH.to_string()
}

fn default_protect_timeout() -> u64 {
    hop_protect::DEFAULT_PROTECT_TIMEOUT.as_secs()
}

fn default_true() -> bool {
    true
}

fn default_upstream() -> String {
    DEFAULT_UPSTREAM.to_string()
}

fn default_dns_timeout() -> u64 {
    5
}

fn default_cache_size() -> usize {
    DEFAULT_MAX_ENTRIES
}
