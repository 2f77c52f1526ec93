//! Name resolution for dialing
//!
//! With the resolver override enabled (the default), lookups go straight to
//! a fixed upstream server through the dialer's own [`Connector`], so the
//! DNS sockets are protected too. Names in the hosts file and the `localhost`
//! names are answered without a query. Otherwise the platform resolver is used.
//!
//! [`Connector`]: crate::Connector

mod cache;
mod config;
mod hosts;
mod resolver;

pub use cache::{AddrCache, CacheStats, DEFAULT_MAX_ENTRIES};
pub use config::{parse_upstream, UpstreamSpec, DEFAULT_UPSTREAM, DNS_PORT};
pub use hosts::Hosts;
pub use resolver::{Resolve, SystemResolver, UpstreamResolver, DEFAULT_DNS_TIMEOUT};
