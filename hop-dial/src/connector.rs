//! Socket setup and connect, with the protect hook
//!
//! Every TCP or UDP socket is created unconnected through `socket2`, handed
//! to the protect hook, and only then bound and connected. In direct mode
//! there is no hook and the sequence is an ordinary system connect.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hop_protect::{Protect, RawSocketHandle};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::stats::DialStats;

/// How outbound sockets are prepared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DialMode {
    /// Plain system sockets
    #[default]
    Direct,
    /// Every socket is protected before it connects
    Protected,
}

impl std::fmt::Display for DialMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialMode::Direct => write!(f, "direct"),
            DialMode::Protected => write!(f, "protected"),
        }
    }
}

/// Caller-imposed bounds on resolution and connect.
///
/// The protect exchange is not bounded by these; it runs under the
/// protector's own timeout.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Limits<'a> {
    deadline: Option<Instant>,
    cancel: Option<&'a CancellationToken>,
}

impl<'a> Limits<'a> {
    pub(crate) fn timeout(limit: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + limit),
            cancel: None,
        }
    }

    pub(crate) fn cancellable(token: &'a CancellationToken) -> Self {
        Self {
            deadline: None,
            cancel: Some(token),
        }
    }

    /// Fail early when the deadline passed or the token fired
    pub(crate) fn check(&self, what: &str) -> Result<()> {
        if self.cancel.is_some_and(|token| token.is_cancelled()) {
            return Err(Error::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(Error::Timeout(what.to_string()));
        }
        Ok(())
    }

    /// Run `fut` under the deadline and cancellation token
    pub(crate) async fn bound<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timed = async {
            match self.deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(what.to_string())),
                },
                None => fut.await,
            }
        };

        match self.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(Error::Cancelled),
                result = timed => result,
            },
            None => timed.await,
        }
    }
}

/// Creates, protects and connects sockets to literal addresses
#[derive(Clone)]
pub struct Connector {
    protector: Option<Arc<dyn Protect>>,
    stats: Arc<DialStats>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("mode", &self.mode())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl Connector {
    /// Connector that never protects
    pub fn direct() -> Self {
        Self {
            protector: None,
            stats: Arc::new(DialStats::new()),
        }
    }

    /// Connector that protects every socket with `protector` before connecting
    pub fn protected(protector: Arc<dyn Protect>) -> Self {
        Self {
            protector: Some(protector),
            stats: Arc::new(DialStats::new()),
        }
    }

    /// Current dial mode
    pub fn mode(&self) -> DialMode {
        if self.protector.is_some() {
            DialMode::Protected
        } else {
            DialMode::Direct
        }
    }

    /// Counters shared by every clone of this connector
    pub fn stats(&self) -> &Arc<DialStats> {
        &self.stats
    }

    /// Connect a TCP stream to `remote`, optionally bound to `local`
    pub async fn connect_tcp(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
    ) -> Result<TcpStream> {
        self.connect_tcp_within(remote, local, &Limits::default())
            .await
    }

    /// Create a UDP socket connected to `remote`, optionally bound to `local`
    pub async fn connect_udp(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
    ) -> Result<UdpSocket> {
        self.connect_udp_within(remote, local, &Limits::default())
            .await
    }

    pub(crate) async fn connect_tcp_within(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        limits: &Limits<'_>,
    ) -> Result<TcpStream> {
        limits.check("connect")?;
        let local = self.local_bind(local, remote);

        let socket = self
            .open_socket(remote, Type::STREAM, Protocol::TCP)
            .await?;
        if let Some(local) = local {
            socket.bind(&local.into())?;
        }

        let socket = TcpSocket::from_std_stream(socket.into());
        let result = limits
            .bound(&format!("connect to {}", remote), async {
                socket.connect(remote).await.map_err(Error::from)
            })
            .await;

        if result.is_err() {
            self.stats.record_connect_failure();
        }
        result
    }

    pub(crate) async fn connect_udp_within(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        limits: &Limits<'_>,
    ) -> Result<UdpSocket> {
        limits.check("connect")?;
        let local = self.local_bind(local, remote);

        let socket = self
            .open_socket(remote, Type::DGRAM, Protocol::UDP)
            .await?;
        if let Some(local) = local {
            socket.bind(&local.into())?;
        }

        let socket = UdpSocket::from_std(socket.into())?;
        let result = limits
            .bound(&format!("connect to {}", remote), async {
                socket.connect(remote).await.map_err(Error::from)
            })
            .await;

        match result {
            Ok(()) => Ok(socket),
            Err(e) => {
                self.stats.record_connect_failure();
                Err(e)
            }
        }
    }

    /// Create an unconnected non-blocking socket and run the protect hook on it.
    ///
    /// On failure the socket is dropped here, so a socket that failed
    /// protection can never reach `connect()`.
    async fn open_socket(&self, remote: SocketAddr, ty: Type, proto: Protocol) -> Result<Socket> {
        self.stats.record_attempt();

        let socket = Socket::new(Domain::for_address(remote), ty, Some(proto))?;
        socket.set_nonblocking(true)?;

        self.setup_socket(&socket, remote).await?;
        Ok(socket)
    }

    /// The protect hook
    async fn setup_socket(&self, socket: &Socket, remote: SocketAddr) -> Result<()> {
        let Some(protector) = &self.protector else {
            return Ok(());
        };

        let fd = raw_handle(socket);
        match protector.protect(fd).await {
            Ok(()) => {
                self.stats.record_protected();
                log::debug!("Protected socket {} for {}", fd, remote);
                Ok(())
            }
            Err(e) => {
                self.stats.record_protect_failure();
                log::warn!("Failed to protect socket {} for {}: {}", fd, remote, e);
                Err(e.into())
            }
        }
    }

    /// Local bind address to apply, if any.
    ///
    /// Binding a protected socket to a caller-chosen local address is not
    /// supported; the address is dropped with a warning.
    fn local_bind(&self, local: Option<SocketAddr>, remote: SocketAddr) -> Option<SocketAddr> {
        match (self.mode(), local) {
            (DialMode::Protected, Some(local)) => {
                self.stats.record_ignored_local_bind();
                log::warn!(
                    "Local address {} ignored for protected dial to {}",
                    local,
                    remote
                );
                None
            }
            (_, local) => local,
        }
    }
}

#[cfg(unix)]
fn raw_handle(socket: &Socket) -> RawSocketHandle {
    use std::os::fd::AsRawFd;
    socket.as_raw_fd()
}

#[cfg(windows)]
fn raw_handle(socket: &Socket) -> RawSocketHandle {
    use std::os::windows::io::AsRawSocket;
    socket.as_raw_socket()
}
