//! hop-dial - Conditional dialer for VPN-aware outbound connections
//!
//! When a VPN routes all traffic through a tunnel, the sockets that carry the
//! tunnel itself (and the DNS lookups for its servers) must bypass it. This
//! crate opens every outbound TCP/UDP socket through a [`Dialer`] that, in
//! protected mode, hands the unconnected socket to a protector (see
//! [`hop_protect`]) and connects only after the protector acknowledged it.
//!
//! Features:
//! - `dial`, `dial_context`, `dial_timeout`, `dial_tcp` and `dial_udp` entry points
//! - Direct mode that behaves exactly like a plain system connect
//! - Resolver override that queries a fixed upstream over protected sockets
//! - TOML configuration and shared dial counters
//!
//! # Example
//!
//! ```no_run
//! use hop_dial::{Config, Dialer};
//! use tokio::io::AsyncWriteExt;
//!
//! # async fn example() -> hop_dial::Result<()> {
//! let mut config = Config::default();
//! config.protect.vpn_mode = true;
//!
//! let dialer = Dialer::from_config(&config)?;
//! let mut conn = dialer.dial("tcp", "example.com:80").await?;
//! conn.write_all(b"GET / HTTP/1.0\r\n\r\n").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod connection;
mod connector;
mod dialer;
pub mod dns;
pub mod error;
mod network;
mod stats;

pub use config::{CommonConfig, Config, DnsConfig, ProtectConfig};
pub use connection::Connection;
pub use connector::{Connector, DialMode};
pub use dialer::{Dialer, DialerBuilder};
pub use dns::{Resolve, SystemResolver, UpstreamResolver, UpstreamSpec};
pub use error::{Error, Result};
pub use network::{parse_target, Network, Target};
pub use stats::{DialStats, StatsSnapshot};
