//! Upstream resolver address parsing
//!
//! Parses upstream specifications in the following formats:
//! - `IP` or `IP:port` or `IP[:port]/udp` - UDP, falling back to TCP on truncation
//! - `IP[:port]/tcp` - TCP only

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Upstream used by the resolver override unless configured otherwise
pub const DEFAULT_UPSTREAM: &str = "119.29.29.29:53";

/// Standard DNS port
pub const DNS_PORT: u16 = 53;

/// Specification for the upstream DNS server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamSpec {
    /// UDP DNS server (traditional DNS)
    Udp { addr: SocketAddr },

    /// TCP DNS server
    Tcp { addr: SocketAddr },
}

impl UpstreamSpec {
    /// Server address
    pub fn addr(&self) -> SocketAddr {
        match self {
            UpstreamSpec::Udp { addr } | UpstreamSpec::Tcp { addr } => *addr,
        }
    }

    /// Get a human-readable description of this server type
    pub fn server_type(&self) -> &'static str {
        match self {
            UpstreamSpec::Udp { .. } => "UDP",
            UpstreamSpec::Tcp { .. } => "TCP",
        }
    }
}

impl Default for UpstreamSpec {
    fn default() -> Self {
        UpstreamSpec::Udp {
            addr: SocketAddr::from(([119, 29, 29, 29], DNS_PORT)),
        }
    }
}

impl std::fmt::Display for UpstreamSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamSpec::Udp { addr } => write!(f, "{}/udp", addr),
            UpstreamSpec::Tcp { addr } => write!(f, "{}/tcp", addr),
        }
    }
}

impl FromStr for UpstreamSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_upstream(s)
    }
}

/// Parse an upstream specification string
///
/// Supported formats:
/// - `8.8.8.8` - UDP to 8.8.8.8:53
/// - `8.8.8.8:5353` - UDP to 8.8.8.8:5353
/// - `8.8.8.8/udp` - UDP to 8.8.8.8:53
/// - `8.8.8.8/tcp` - TCP to 8.8.8.8:53
/// - `[2001:4860:4860::8888]:53/tcp` - TCP over IPv6
pub fn parse_upstream(s: &str) -> Result<UpstreamSpec> {
    let s = s.trim();

    // Check for protocol suffix
    let (addr_part, tcp) = match s.rfind('/') {
        Some(idx) => {
            let proto = &s[idx + 1..];
            match proto.to_lowercase().as_str() {
                "udp" => (&s[..idx], false),
                "tcp" => (&s[..idx], true),
                _ => {
                    return Err(Error::Config(format!(
                        "unknown DNS protocol '{}', expected 'udp' or 'tcp'",
                        proto
                    )))
                }
            }
        }
        None => (s, false),
    };

    let addr = parse_socket_addr(addr_part, DNS_PORT)?;

    if tcp {
        Ok(UpstreamSpec::Tcp { addr })
    } else {
        Ok(UpstreamSpec::Udp { addr })
    }
}

/// Parse an IP address with optional port, defaulting to the given port
fn parse_socket_addr(s: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = SocketAddr::from_str(s) {
        return Ok(addr);
    }

    // Bracketed IPv6 without a port: [::1]
    if let Some(inner) = s.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
        let ip = inner
            .parse::<IpAddr>()
            .map_err(|e| Error::Config(format!("invalid IP address '{}': {}", inner, e)))?;
        return Ok(SocketAddr::new(ip, default_port));
    }

    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    Err(Error::Config(format!(
        "cannot parse DNS server address '{}'",
        s
    )))
}
