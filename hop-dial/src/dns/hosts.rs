//! Static host table
//!
//! Names listed in the hosts file, and the `localhost` names, are answered
//! locally and never reach the upstream server.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

/// Path to the system hosts file
#[cfg(unix)]
pub const HOSTS_PATH: &str = "/etc/hosts";

/// Parsed hosts file
#[derive(Debug, Clone, Default)]
pub struct Hosts {
    by_name: HashMap<String, Vec<IpAddr>>,
}

impl Hosts {
    /// The system hosts file, or an empty table if it cannot be read
    pub fn system() -> Self {
        #[cfg(unix)]
        {
            match Self::load(HOSTS_PATH) {
                Ok(hosts) => {
                    log::debug!("Loaded {} names from {}", hosts.len(), HOSTS_PATH);
                    hosts
                }
                Err(e) => {
                    log::debug!("Cannot read {}: {}", HOSTS_PATH, e);
                    Self::default()
                }
            }
        }

        #[cfg(not(unix))]
        {
            Self::default()
        }
    }

    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    /// Parse `ip name [alias...]` lines; comments and bad lines are skipped
    pub fn parse(content: &str) -> Self {
        let mut by_name: HashMap<String, Vec<IpAddr>> = HashMap::new();

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or_default();
            let mut fields = line.split_whitespace();
            let Some(ip) = fields.next().and_then(|ip| ip.parse::<IpAddr>().ok()) else {
                continue;
            };

            for name in fields {
                let addrs = by_name.entry(normalize(name)).or_default();
                if !addrs.contains(&ip) {
                    addrs.push(ip);
                }
            }
        }

        Self { by_name }
    }

    /// Addresses for `host`, `None` when the upstream must be asked
    pub fn lookup(&self, host: &str) -> Option<Vec<IpAddr>> {
        let name = normalize(host);
        if let Some(addrs) = self.by_name.get(&name) {
            return Some(addrs.clone());
        }

        if name == "localhost" || name.ends_with(".localhost") {
            return Some(vec![
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            ]);
        }
        None
    }

    pub(crate) fn len(&self) -> usize {
        self.by_name.len()
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_lowercase()
}
