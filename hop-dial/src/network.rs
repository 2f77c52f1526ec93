//! Network kinds and dial address parsing

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Network kind of a dial request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    /// TCP over IPv4 or IPv6
    Tcp,
    /// TCP over IPv4 only
    Tcp4,
    /// TCP over IPv6 only
    Tcp6,
    /// UDP over IPv4 or IPv6
    Udp,
    /// UDP over IPv4 only
    Udp4,
    /// UDP over IPv6 only
    Udp6,
    /// Unix domain stream socket, addressed by path
    Unix,
}

impl Network {
    /// TCP of any address family
    pub fn is_tcp(&self) -> bool {
        matches!(self, Network::Tcp | Network::Tcp4 | Network::Tcp6)
    }

    /// UDP of any address family
    pub fn is_udp(&self) -> bool {
        matches!(self, Network::Udp | Network::Udp4 | Network::Udp6)
    }

    /// Whether connections on this network are byte streams
    pub fn is_stream(&self) -> bool {
        !self.is_udp()
    }

    /// Whether an address of this family may be dialed on this network
    pub fn accepts(&self, ip: &IpAddr) -> bool {
        match self {
            Network::Tcp4 | Network::Udp4 => ip.is_ipv4(),
            Network::Tcp6 | Network::Udp6 => ip.is_ipv6(),
            Network::Tcp | Network::Udp => true,
            Network::Unix => false,
        }
    }

    /// Address used when the host part of an address is empty
    fn loopback(&self) -> IpAddr {
        match self {
            Network::Tcp6 | Network::Udp6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
            _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Udp => "udp",
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
            Network::Unix => "unix",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "udp" => Ok(Network::Udp),
            "udp4" => Ok(Network::Udp4),
            "udp6" => Ok(Network::Udp6),
            "unix" => Ok(Network::Unix),
            _ => Err(Error::InvalidNetwork(format!(
                "unknown network '{}', expected tcp[4|6], udp[4|6] or unix",
                s
            ))),
        }
    }
}

/// Destination of a TCP or UDP dial
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Literal socket address, no resolution needed
    Addr(SocketAddr),
    /// Host name that must be resolved first
    Host { host: String, port: u16 },
}

/// Parse a `host:port` dial address for an IP network.
///
/// Accepted forms:
/// - `1.2.3.4:80`, `[::1]:80` - literal addresses
/// - `example.com:80` - names, resolved later
/// - `:80` - the loopback address of the network's family
pub fn parse_target(network: Network, address: &str) -> Result<Target> {
    let (host, port) = split_host_port(address)?;

    let port = port
        .parse::<u16>()
        .map_err(|_| Error::InvalidAddress(format!("invalid port in '{}'", address)))?;

    if host.is_empty() {
        return Ok(Target::Addr(SocketAddr::new(network.loopback(), port)));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        if !network.accepts(&ip) {
            return Err(Error::NoAddress(format!("{} on {}", address, network)));
        }
        return Ok(Target::Addr(SocketAddr::new(ip, port)));
    }

    Ok(Target::Host {
        host: host.to_string(),
        port,
    })
}

/// Split `host:port`, `[host]:port` into host and port strings
fn split_host_port(address: &str) -> Result<(&str, &str)> {
    let missing_port = || Error::InvalidAddress(format!("missing port in address '{}'", address));

    if let Some(rest) = address.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| Error::InvalidAddress(format!("missing ']' in address '{}'", address)))?;
        let port = rest[end + 1..].strip_prefix(':').ok_or_else(missing_port)?;
        return Ok((&rest[..end], port));
    }

    let colon = address.rfind(':').ok_or_else(missing_port)?;
    let host = &address[..colon];
    if host.contains(':') {
        return Err(Error::InvalidAddress(format!(
            "too many colons in address '{}'",
            address
        )));
    }
    Ok((host, &address[colon + 1..]))
}
