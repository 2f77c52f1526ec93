//! The conditional dialer
//!
//! A [`Dialer`] is built once, in either direct or protected mode, and then
//! shared. Every dial entry point parses the network and address, resolves
//! names through the injected [`Resolve`] implementation, and connects
//! through the [`Connector`], which runs the protect hook in protected mode.

use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hop_protect::Protect;
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::connection::Connection;
use crate::connector::{Connector, DialMode, Limits};
use crate::dns::{
    Resolve, SystemResolver, UpstreamResolver, UpstreamSpec, DEFAULT_DNS_TIMEOUT,
    DEFAULT_MAX_ENTRIES,
};
use crate::error::{Error, Result};
use crate::network::{parse_target, Network, Target};
use crate::stats::DialStats;

/// Dialer shared by everything in the process that opens outbound connections
#[derive(Clone)]
pub struct Dialer {
    connector: Connector,
    resolver: Arc<dyn Resolve>,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("connector", &self.connector)
            .finish_non_exhaustive()
    }
}

impl Default for Dialer {
    fn default() -> Self {
        Self::direct()
    }
}

impl Dialer {
    pub fn builder() -> DialerBuilder {
        DialerBuilder::default()
    }

    /// Plain system dialer with the system resolver
    pub fn direct() -> Self {
        Self {
            connector: Connector::direct(),
            resolver: Arc::new(SystemResolver),
        }
    }

    /// Build the dialer described by `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut builder = Self::builder()
            .vpn_mode(config.protect.vpn_mode)
            .protect_timeout(config.protect.timeout());

        #[cfg(unix)]
        {
            builder = builder.protect_path(&config.protect.path);
        }

        if config.dns.override_system {
            builder = builder
                .upstream_dns(config.dns.upstream_spec()?)
                .dns_timeout(config.dns.timeout())
                .dns_cache_size(config.dns.cache_size);
        }

        builder.build()
    }

    pub fn mode(&self) -> DialMode {
        self.connector.mode()
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    pub fn resolver(&self) -> &Arc<dyn Resolve> {
        &self.resolver
    }

    pub fn stats(&self) -> &Arc<DialStats> {
        self.connector.stats()
    }

    /// Connect to `address` on `network`
    ///
    /// `network` is one of `tcp`, `tcp4`, `tcp6`, `udp`, `udp4`, `udp6` or
    /// `unix`. For IP networks `address` is `host:port`; for `unix` it is a
    /// filesystem path.
    pub async fn dial(&self, network: &str, address: &str) -> Result<Connection> {
        self.dial_within(network, address, &Limits::default()).await
    }

    /// Like [`dial`](Self::dial), aborted when `token` is cancelled.
    ///
    /// Cancellation covers resolution and connect. A protect exchange that
    /// is already running finishes under its own timeout first.
    pub async fn dial_context(
        &self,
        token: &CancellationToken,
        network: &str,
        address: &str,
    ) -> Result<Connection> {
        self.dial_within(network, address, &Limits::cancellable(token))
            .await
    }

    /// Like [`dial`](Self::dial), bounded by `timeout` (protect exchange excluded)
    pub async fn dial_timeout(
        &self,
        network: &str,
        address: &str,
        timeout: Duration,
    ) -> Result<Connection> {
        self.dial_within(network, address, &Limits::timeout(timeout))
            .await
    }

    /// Connect a TCP stream to a literal address.
    ///
    /// `local` is honoured in direct mode only; in protected mode it is
    /// dropped with a warning.
    pub async fn dial_tcp(
        &self,
        network: &str,
        local: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> Result<TcpStream> {
        let network: Network = network.parse()?;
        if !network.is_tcp() {
            return Err(Error::InvalidNetwork(format!(
                "{} is not a TCP network",
                network
            )));
        }
        check_family(network, remote)?;
        self.connector.connect_tcp(remote, local).await
    }

    /// Create a UDP socket connected to a literal address.
    ///
    /// `local` is handled as in [`dial_tcp`](Self::dial_tcp).
    pub async fn dial_udp(
        &self,
        network: &str,
        local: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> Result<UdpSocket> {
        let network: Network = network.parse()?;
        if !network.is_udp() {
            return Err(Error::InvalidNetwork(format!(
                "{} is not a UDP network",
                network
            )));
        }
        check_family(network, remote)?;
        self.connector.connect_udp(remote, local).await
    }

    async fn dial_within(
        &self,
        network: &str,
        address: &str,
        limits: &Limits<'_>,
    ) -> Result<Connection> {
        limits.check("dial")?;
        let network: Network = network.parse()?;

        if network == Network::Unix {
            return dial_unix(address, limits).await;
        }

        let addrs = self.resolve_target(network, address, limits).await?;

        let mut first_error = None;
        for addr in addrs {
            let result = if network.is_tcp() {
                self.connector
                    .connect_tcp_within(addr, None, limits)
                    .await
                    .map(Connection::Tcp)
            } else {
                self.connector
                    .connect_udp_within(addr, None, limits)
                    .await
                    .map(Connection::Udp)
            };

            match result {
                Ok(conn) => return Ok(conn),
                // Not specific to this address
                Err(e @ (Error::Cancelled | Error::Timeout(_) | Error::Protect(_))) => {
                    return Err(e)
                }
                Err(e) => {
                    log::debug!("Dial {} {} failed: {}", network, addr, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        Err(first_error.unwrap_or_else(|| Error::NoAddress(address.to_string())))
    }

    /// Turn a dial address into the candidate socket addresses, in order
    async fn resolve_target(
        &self,
        network: Network,
        address: &str,
        limits: &Limits<'_>,
    ) -> Result<Vec<SocketAddr>> {
        let (host, port) = match parse_target(network, address)? {
            Target::Addr(addr) => return Ok(vec![addr]),
            Target::Host { host, port } => (host, port),
        };

        let ips = limits
            .bound(&format!("resolve {}", host), self.resolver.lookup_ip(&host))
            .await?;

        let addrs: Vec<SocketAddr> = ips
            .into_iter()
            .filter(|ip| network.accepts(ip))
            .map(|ip| SocketAddr::new(ip, port))
            .collect();

        if addrs.is_empty() {
            return Err(Error::NoAddress(format!("{} on {}", host, network)));
        }
        log::debug!("Resolved {} to {:?}", host, addrs);
        Ok(addrs)
    }
}

fn check_family(network: Network, remote: SocketAddr) -> Result<()> {
    if network.accepts(&remote.ip()) {
        Ok(())
    } else {
        Err(Error::NoAddress(format!("{} on {}", remote, network)))
    }
}

/// Unix-domain dials are local and never protected
#[cfg(unix)]
async fn dial_unix(path: &str, limits: &Limits<'_>) -> Result<Connection> {
    let stream = limits
        .bound(&format!("connect to {}", path), async {
            tokio::net::UnixStream::connect(path)
                .await
                .map_err(Error::from)
        })
        .await?;
    Ok(Connection::Unix(stream))
}

#[cfg(not(unix))]
async fn dial_unix(_path: &str, _limits: &Limits<'_>) -> Result<Connection> {
    Err(Error::Unsupported(
        "unix sockets are not available on this platform".into(),
    ))
}

/// Builder for [`Dialer`]
#[derive(Default)]
pub struct DialerBuilder {
    vpn_mode: bool,
    protector: Option<Arc<dyn Protect>>,
    #[cfg(unix)]
    protect_path: Option<PathBuf>,
    protect_timeout: Option<Duration>,
    resolver: Option<Arc<dyn Resolve>>,
    upstream: Option<UpstreamSpec>,
    dns_timeout: Option<Duration>,
    dns_cache_size: Option<usize>,
}

impl DialerBuilder {
    /// Protect every socket before connecting
    pub fn vpn_mode(mut self, enabled: bool) -> Self {
        self.vpn_mode = enabled;
        self
    }

    /// Use a custom protector; implies VPN mode
    pub fn protector(mut self, protector: Arc<dyn Protect>) -> Self {
        self.protector = Some(protector);
        self.vpn_mode = true;
        self
    }

    /// Path of the protector's Unix socket
    #[cfg(unix)]
    pub fn protect_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.protect_path = Some(path.into());
        self
    }

    /// Per-step timeout of the protect exchange
    pub fn protect_timeout(mut self, timeout: Duration) -> Self {
        self.protect_timeout = Some(timeout);
        self
    }

    /// Use a custom resolver, overriding [`upstream_dns`](Self::upstream_dns)
    pub fn resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Resolve names by querying `upstream` through the dialer itself
    pub fn upstream_dns(mut self, upstream: UpstreamSpec) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn dns_timeout(mut self, timeout: Duration) -> Self {
        self.dns_timeout = Some(timeout);
        self
    }

    pub fn dns_cache_size(mut self, size: usize) -> Self {
        self.dns_cache_size = Some(size);
        self
    }

    pub fn build(self) -> Result<Dialer> {
        let connector = if self.vpn_mode {
            let protector = match self.protector {
                Some(protector) => protector,
                None => self.default_protector()?,
            };
            Connector::protected(protector)
        } else {
            Connector::direct()
        };

        let resolver: Arc<dyn Resolve> = match (self.resolver, self.upstream) {
            (Some(resolver), _) => resolver,
            (None, Some(upstream)) => {
                log::info!("Resolving host names via {}", upstream);
                Arc::new(UpstreamResolver::new(
                    connector.clone(),
                    upstream,
                    self.dns_timeout.unwrap_or(DEFAULT_DNS_TIMEOUT),
                    self.dns_cache_size.unwrap_or(DEFAULT_MAX_ENTRIES),
                ))
            }
            (None, None) => Arc::new(SystemResolver),
        };

        log::debug!("Dialer ready in {} mode", connector.mode());
        Ok(Dialer {
            connector,
            resolver,
        })
    }

    #[cfg(unix)]
    fn default_protector(&self) -> Result<Arc<dyn Protect>> {
        let path = self
            .protect_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(hop_protect::DEFAULT_PROTECT_PATH));
        let timeout = self
            .protect_timeout
            .unwrap_or(hop_protect::DEFAULT_PROTECT_TIMEOUT);

        log::info!(
            "VPN mode: protecting sockets via {} (timeout {:?})",
            path.display(),
            timeout
        );
        Ok(Arc::new(
            hop_protect::UnixProtector::new(path).with_timeout(timeout),
        ))
    }

    #[cfg(not(unix))]
    fn default_protector(&self) -> Result<Arc<dyn Protect>> {
        Err(Error::Unsupported(
            "socket protection needs Unix descriptor passing".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::IpAddr;
    use tokio::net::TcpListener;

    struct FixedResolver(Vec<IpAddr>);

    #[async_trait]
    impl Resolve for FixedResolver {
        async fn lookup_ip(&self, _host: &str) -> Result<Vec<IpAddr>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_builder_defaults_to_direct() {
        let dialer = Dialer::builder().build().unwrap();
        assert_eq!(dialer.mode(), DialMode::Direct);
        assert_eq!(Dialer::default().mode(), DialMode::Direct);
    }

    #[cfg(unix)]
    #[test]
    fn test_from_config_vpn_mode() {
        let mut config = Config::default();
        config.protect.vpn_mode = true;
        let dialer = Dialer::from_config(&config).unwrap();
        assert_eq!(dialer.mode(), DialMode::Protected);
    }

    #[test]
    fn test_from_config_rejects_bad_upstream() {
        let mut config = Config::default();
        config.dns.upstream = "not-an-ip".into();
        assert!(Dialer::from_config(&config).unwrap_err().is_config_error());
    }

    #[tokio::test]
    async fn test_dial_rejects_bad_input() {
        let dialer = Dialer::direct();
        assert!(matches!(
            dialer.dial("sctp", "127.0.0.1:1").await,
            Err(Error::InvalidNetwork(_))
        ));
        assert!(matches!(
            dialer.dial("tcp", "127.0.0.1").await,
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(
            dialer.dial("tcp6", "127.0.0.1:80").await,
            Err(Error::NoAddress(_))
        ));
        assert!(matches!(
            dialer
                .dial_tcp("udp", None, "127.0.0.1:80".parse().unwrap())
                .await,
            Err(Error::InvalidNetwork(_))
        ));
    }

    #[tokio::test]
    async fn test_dial_filters_resolved_family() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dialer = Dialer::builder()
            .resolver(Arc::new(FixedResolver(vec![
                "::1".parse().unwrap(),
                "127.0.0.1".parse().unwrap(),
            ])))
            .build()
            .unwrap();

        let conn = dialer
            .dial("tcp4", &format!("service.test:{}", port))
            .await
            .unwrap();
        assert_eq!(conn.peer_addr().unwrap(), Some(listener.local_addr().unwrap()));

        let err = Dialer::builder()
            .resolver(Arc::new(FixedResolver(vec!["::1".parse().unwrap()])))
            .build()
            .unwrap()
            .dial("udp4", "service.test:53")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoAddress(_)));
    }

    #[tokio::test]
    async fn test_dial_falls_through_to_next_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Nothing listens on [::1] at this port, so the first candidate fails
        let dialer = Dialer::builder()
            .resolver(Arc::new(FixedResolver(vec![
                "::1".parse().unwrap(),
                "127.0.0.1".parse().unwrap(),
            ])))
            .build()
            .unwrap();

        let conn = dialer
            .dial("tcp", &format!("service.test:{}", port))
            .await
            .unwrap();
        assert_eq!(conn.peer_addr().unwrap(), Some(listener.local_addr().unwrap()));
        assert_eq!(dialer.stats().snapshot().attempts, 2);
    }
}
