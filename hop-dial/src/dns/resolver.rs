//! Hostname resolution
//!
//! [`SystemResolver`] defers to the platform resolver. [`UpstreamResolver`]
//! queries a fixed upstream server itself, opening its sockets through a
//! [`Connector`] so that in protected mode the DNS traffic is protected like
//! any other dial. Names found in the hosts table never reach the upstream.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::cache::{AddrCache, CacheStats};
use super::config::UpstreamSpec;
use super::hosts::Hosts;
use crate::connector::Connector;
use crate::error::{Error, Result};

/// Default timeout for one upstream lookup
pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum UDP DNS response size
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

/// Maximum TCP DNS response size
const MAX_TCP_RESPONSE_SIZE: usize = 65535;

/// Resolves a hostname to its IP addresses
#[async_trait]
pub trait Resolve: Send + Sync {
    /// Look up every A and AAAA address of `host`
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// The platform resolver (`getaddrinfo`)
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| Error::Dns(format!("failed to resolve {}: {}", host, e)))?;

        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in addrs {
            if !ips.contains(&addr.ip()) {
                ips.push(addr.ip());
            }
        }
        Ok(ips)
    }
}

/// Resolver that queries one upstream server directly
pub struct UpstreamResolver {
    connector: Connector,
    upstream: UpstreamSpec,
    timeout: Duration,
    hosts: Hosts,
    cache: RwLock<AddrCache>,
}

impl std::fmt::Debug for UpstreamResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResolver")
            .field("upstream", &self.upstream)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl UpstreamResolver {
    pub fn new(
        connector: Connector,
        upstream: UpstreamSpec,
        timeout: Duration,
        cache_size: usize,
    ) -> Self {
        Self {
            connector,
            upstream,
            timeout,
            hosts: Hosts::system(),
            cache: RwLock::new(AddrCache::new(cache_size)),
        }
    }

    /// Replace the system hosts table
    pub fn with_hosts(mut self, hosts: Hosts) -> Self {
        self.hosts = hosts;
        self
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.read().await.stats()
    }

    /// Look up one record type, consulting the cache first
    async fn lookup(&self, host: &str, rtype: RecordType) -> Result<Vec<IpAddr>> {
        if let Some(addrs) = self.cache.write().await.get(host, rtype) {
            log::debug!("DNS cache hit for {} {}", host, rtype);
            return Ok(addrs);
        }

        let deadline = Instant::now() + self.timeout;
        let query = build_query(host, rtype)?;
        let response = match tokio::time::timeout_at(deadline, self.exchange(&query, deadline)).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Dns(format!(
                    "{} query for {} to {} timed out",
                    rtype,
                    host,
                    self.upstream.addr()
                )))
            }
        };

        let (addrs, ttl) = extract_addrs(&response, rtype)?;
        log::debug!("Resolved {} {} -> {:?} (ttl {})", host, rtype, addrs, ttl);
        self.cache
            .write()
            .await
            .insert(host, rtype, addrs.clone(), ttl);
        Ok(addrs)
    }

    /// Send `query` to the upstream and return the matching response
    async fn exchange(&self, query: &Message, deadline: Instant) -> Result<Message> {
        let bytes = query
            .to_vec()
            .map_err(|e| Error::Dns(format!("failed to encode DNS query: {}", e)))?;

        match self.upstream {
            UpstreamSpec::Tcp { addr } => self.exchange_tcp(addr, query.id(), &bytes).await,
            UpstreamSpec::Udp { addr } => {
                let response = self.exchange_udp(addr, query.id(), &bytes, deadline).await?;
                if response.truncated() {
                    log::debug!("Truncated response from {}, retrying over TCP", addr);
                    self.exchange_tcp(addr, query.id(), &bytes).await
                } else {
                    Ok(response)
                }
            }
        }
    }

    async fn exchange_udp(
        &self,
        addr: SocketAddr,
        id: u16,
        query: &[u8],
        deadline: Instant,
    ) -> Result<Message> {
        let socket = self.connector.connect_udp(addr, None).await?;
        socket
            .send(query)
            .await
            .map_err(|e| Error::Dns(format!("failed to send DNS query: {}", e)))?;

        let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
        loop {
            let len = match tokio::time::timeout_at(deadline, socket.recv(&mut buf)).await {
                Ok(Ok(len)) => len,
                Ok(Err(e)) => {
                    return Err(Error::Dns(format!(
                        "failed to receive DNS response: {}",
                        e
                    )))
                }
                Err(_) => return Err(Error::Dns("DNS query timed out".into())),
            };

            match Message::from_vec(&buf[..len]) {
                Ok(message) if message.id() == id => return Ok(message),
                Ok(message) => {
                    log::debug!("Ignoring DNS response with id {} (want {})", message.id(), id)
                }
                Err(e) => log::debug!("Ignoring malformed DNS response from {}: {}", addr, e),
            }
        }
    }

    async fn exchange_tcp(&self, addr: SocketAddr, id: u16, query: &[u8]) -> Result<Message> {
        let mut stream = self.connector.connect_tcp(addr, None).await?;
        let response = dns_over_stream(&mut stream, query).await?;

        let message = Message::from_vec(&response)
            .map_err(|e| Error::Dns(format!("invalid DNS response: {}", e)))?;
        if message.id() != id {
            return Err(Error::Dns(format!(
                "DNS response id {} does not match query id {}",
                message.id(),
                id
            )));
        }
        Ok(message)
    }
}

#[async_trait]
impl Resolve for UpstreamResolver {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Some(addrs) = self.hosts.lookup(host) {
            log::debug!("Resolved {} from hosts -> {:?}", host, addrs);
            return Ok(addrs);
        }

        let (v4, v6) = tokio::join!(
            self.lookup(host, RecordType::A),
            self.lookup(host, RecordType::AAAA)
        );

        match (v4, v6) {
            (Err(e), Err(_)) => Err(e),
            (v4, v6) => {
                let mut addrs = v4.unwrap_or_default();
                addrs.extend(v6.unwrap_or_default());
                if addrs.is_empty() {
                    Err(Error::NoAddress(host.to_string()))
                } else {
                    Ok(addrs)
                }
            }
        }
    }
}

/// Build a recursive query for `host`
fn build_query(host: &str, rtype: RecordType) -> Result<Message> {
    let fqdn = if host.ends_with('.') {
        host.to_string()
    } else {
        format!("{}.", host)
    };
    let name = Name::from_ascii(&fqdn)
        .map_err(|e| Error::Dns(format!("invalid host name '{}': {}", host, e)))?;

    let mut message = Message::new();
    message
        .set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, rtype));
    Ok(message)
}

/// Pull the addresses of type `rtype` and their minimum TTL out of a response
fn extract_addrs(response: &Message, rtype: RecordType) -> Result<(Vec<IpAddr>, u32)> {
    match response.response_code() {
        ResponseCode::NoError => {}
        ResponseCode::NXDomain => return Ok((Vec::new(), 0)),
        code => return Err(Error::Dns(format!("upstream answered {}", code))),
    }

    let mut addrs = Vec::new();
    let mut min_ttl: Option<u32> = None;
    for record in response.answers() {
        let ip = match (record.data(), rtype) {
            (Some(RData::A(a)), RecordType::A) => IpAddr::V4(a.0),
            (Some(RData::AAAA(aaaa)), RecordType::AAAA) => IpAddr::V6(aaaa.0),
            _ => continue,
        };
        min_ttl = Some(min_ttl.map_or(record.ttl(), |m| m.min(record.ttl())));
        addrs.push(ip);
    }

    Ok((addrs, min_ttl.unwrap_or(0)))
}

/// Send a DNS query over a stream with the two-byte length prefix
async fn dns_over_stream<S>(stream: &mut S, query: &[u8]) -> Result<Vec<u8>>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let len = u16::try_from(query.len())
        .map_err(|_| Error::Dns("DNS query too large".into()))?;
    let mut msg = Vec::with_capacity(2 + query.len());
    msg.extend_from_slice(&len.to_be_bytes());
    msg.extend_from_slice(query);

    stream
        .write_all(&msg)
        .await
        .map_err(|e| Error::Dns(format!("stream write failed: {}", e)))?;

    let mut len_buf = [0u8; 2];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| Error::Dns(format!("stream read failed: {}", e)))?;

    let response_len = u16::from_be_bytes(len_buf) as usize;
    if response_len > MAX_TCP_RESPONSE_SIZE {
        return Err(Error::Dns("DNS response too large".into()));
    }

    let mut response = vec![0u8; response_len];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| Error::Dns(format!("stream read failed: {}", e)))?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::{A, AAAA};
    use hickory_proto::rr::Record;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::{TcpListener, UdpSocket};

    fn answer(query: &Message, truncated: bool) -> Message {
        let mut response = Message::new();
        response
            .set_id(query.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_response_code(ResponseCode::NoError)
            .set_truncated(truncated);

        let q = &query.queries()[0];
        response.add_query(q.clone());
        if !truncated {
            let rdata = match q.query_type() {
                RecordType::A => RData::A(A(Ipv4Addr::new(192, 0, 2, 10))),
                _ => RData::AAAA(AAAA(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 10))),
            };
            response.add_answer(Record::from_rdata(q.name().clone(), 120, rdata));
        }
        response
    }

    /// UDP server answering every query; `truncate` forces the TCP path
    async fn spawn_udp_server(truncate: bool) -> (SocketAddr, Arc<AtomicUsize>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let queries = Arc::new(AtomicUsize::new(0));
        let counter = queries.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                counter.fetch_add(1, Ordering::SeqCst);
                let query = Message::from_vec(&buf[..len]).unwrap();

                // A stray reply with the wrong id must be skipped
                let mut stray = answer(&query, false);
                stray.set_id(query.id().wrapping_add(1));
                socket.send_to(&stray.to_vec().unwrap(), from).await.unwrap();

                let response = answer(&query, truncate);
                socket.send_to(&response.to_vec().unwrap(), from).await.unwrap();
            }
        });
        (addr, queries)
    }

    /// TCP server on `addr` answering length-prefixed queries
    async fn spawn_tcp_server(addr: SocketAddr) -> Arc<AtomicUsize> {
        let listener = TcpListener::bind(addr).await.unwrap();
        let queries = Arc::new(AtomicUsize::new(0));
        let counter = queries.clone();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let counter = counter.clone();
                tokio::spawn(async move {
                    let mut len_buf = [0u8; 2];
                    stream.read_exact(&mut len_buf).await.unwrap();
                    let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
                    stream.read_exact(&mut buf).await.unwrap();
                    counter.fetch_add(1, Ordering::SeqCst);

                    let query = Message::from_vec(&buf).unwrap();
                    let response = answer(&query, false).to_vec().unwrap();
                    stream
                        .write_all(&(response.len() as u16).to_be_bytes())
                        .await
                        .unwrap();
                    stream.write_all(&response).await.unwrap();
                });
            }
        });
        queries
    }

    #[test]
    fn test_build_query() {
        let query = build_query("example.com", RecordType::AAAA).unwrap();
        assert!(query.recursion_desired());
        assert_eq!(query.queries().len(), 1);
        assert_eq!(query.queries()[0].query_type(), RecordType::AAAA);
        assert_eq!(
            query.queries()[0].name(),
            &Name::from_str("example.com.").unwrap()
        );
    }

    #[test]
    fn test_extract_addrs_filters_by_type() {
        let query = build_query("example.com", RecordType::A).unwrap();
        let mut response = answer(&query, false);
        response.add_answer(Record::from_rdata(
            Name::from_str("example.com.").unwrap(),
            60,
            RData::AAAA(AAAA(Ipv6Addr::LOCALHOST)),
        ));

        let (addrs, ttl) = extract_addrs(&response, RecordType::A).unwrap();
        assert_eq!(addrs, vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10))]);
        assert_eq!(ttl, 120);
    }

    #[test]
    fn test_extract_addrs_nxdomain_and_failure() {
        let query = build_query("missing.test", RecordType::A).unwrap();
        let mut response = answer(&query, true);

        response.set_response_code(ResponseCode::NXDomain);
        assert!(extract_addrs(&response, RecordType::A).unwrap().0.is_empty());

        response.set_response_code(ResponseCode::ServFail);
        assert!(extract_addrs(&response, RecordType::A).is_err());
    }

    #[tokio::test]
    async fn test_udp_lookup_and_cache() {
        let (addr, queries) = spawn_udp_server(false).await;
        let resolver = UpstreamResolver::new(
            Connector::direct(),
            UpstreamSpec::Udp { addr },
            Duration::from_secs(2),
            16,
        );

        let ips = resolver.lookup_ip("example.com").await.unwrap();
        assert_eq!(ips.len(), 2);
        assert!(ips.contains(&IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10))));
        assert_eq!(queries.load(Ordering::SeqCst), 2);

        let again = resolver.lookup_ip("EXAMPLE.com").await.unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(queries.load(Ordering::SeqCst), 2, "second lookup is cached");
        assert_eq!(resolver.cache_stats().await.hits, 2);
    }

    #[tokio::test]
    async fn test_truncated_udp_falls_back_to_tcp() {
        let (addr, _) = spawn_udp_server(true).await;
        let tcp_queries = spawn_tcp_server(addr).await;
        let resolver = UpstreamResolver::new(
            Connector::direct(),
            UpstreamSpec::Udp { addr },
            Duration::from_secs(2),
            16,
        );

        let ips = resolver.lookup_ip("example.com").await.unwrap();
        assert_eq!(ips.len(), 2);
        assert_eq!(tcp_queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_silent_upstream_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let resolver = UpstreamResolver::new(
            Connector::direct(),
            UpstreamSpec::Udp {
                addr: silent.local_addr().unwrap(),
            },
            Duration::from_millis(200),
            16,
        );

        let err = resolver.lookup_ip("example.com").await.unwrap_err();
        assert!(matches!(err, Error::Dns(_)));
    }

    #[tokio::test]
    async fn test_hosts_answer_without_upstream() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let resolver = UpstreamResolver::new(
            Connector::direct(),
            UpstreamSpec::Udp {
                addr: silent.local_addr().unwrap(),
            },
            Duration::from_millis(200),
            16,
        )
        .with_hosts(Hosts::parse("10.9.8.7 printer.lan\n"));

        assert_eq!(
            resolver.lookup_ip("printer.lan").await.unwrap(),
            vec![IpAddr::V4(Ipv4Addr::new(10, 9, 8, 7))]
        );
        assert!(resolver
            .lookup_ip("localhost")
            .await
            .unwrap()
            .contains(&IpAddr::V4(Ipv4Addr::LOCALHOST)));

        let mut buf = [0u8; 512];
        assert!(silent.try_recv_from(&mut buf).is_err(), "upstream was queried");
    }

    #[tokio::test]
    async fn test_missing_aaaa_is_cached() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let aaaa_queries = Arc::new(AtomicUsize::new(0));
        let counter = aaaa_queries.clone();

        // Answers A queries only; AAAA gets an empty NoError response
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                let query = Message::from_vec(&buf[..len]).unwrap();
                let mut response = answer(&query, false);
                if query.queries()[0].query_type() == RecordType::AAAA {
                    counter.fetch_add(1, Ordering::SeqCst);
                    response.take_answers();
                }
                socket.send_to(&response.to_vec().unwrap(), from).await.unwrap();
            }
        });

        let resolver = UpstreamResolver::new(
            Connector::direct(),
            UpstreamSpec::Udp { addr },
            Duration::from_secs(2),
            16,
        );

        for _ in 0..3 {
            let ips = resolver.lookup_ip("v4only.test").await.unwrap();
            assert_eq!(ips, vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10))]);
        }
        assert_eq!(aaaa_queries.load(Ordering::SeqCst), 1);
    }
}
