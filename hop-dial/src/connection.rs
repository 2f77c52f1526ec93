//! Connection handle returned by the generic dial entry points

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};

#[cfg(unix)]
use tokio::net::UnixStream;

/// An established connection of any supported network kind.
///
/// Reads and writes on a UDP connection map to `recv`/`send` on the
/// connected socket, one datagram per call.
#[derive(Debug)]
pub enum Connection {
    Tcp(TcpStream),
    Udp(UdpSocket),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Connection {
    /// Local address for TCP and UDP connections
    pub fn local_addr(&self) -> io::Result<Option<SocketAddr>> {
        match self {
            Connection::Tcp(s) => s.local_addr().map(Some),
            Connection::Udp(s) => s.local_addr().map(Some),
            #[cfg(unix)]
            Connection::Unix(_) => Ok(None),
        }
    }

    /// Remote address for TCP and UDP connections
    pub fn peer_addr(&self) -> io::Result<Option<SocketAddr>> {
        match self {
            Connection::Tcp(s) => s.peer_addr().map(Some),
            Connection::Udp(s) => s.peer_addr().map(Some),
            #[cfg(unix)]
            Connection::Unix(_) => Ok(None),
        }
    }

    /// Take the TCP stream, or give the connection back
    pub fn into_tcp(self) -> Result<TcpStream, Self> {
        match self {
            Connection::Tcp(s) => Ok(s),
            other => Err(other),
        }
    }

    /// Take the connected UDP socket, or give the connection back
    pub fn into_udp(self) -> Result<UdpSocket, Self> {
        match self {
            Connection::Udp(s) => Ok(s),
            other => Err(other),
        }
    }

    /// Take the Unix stream, or give the connection back
    #[cfg(unix)]
    pub fn into_unix(self) -> Result<UnixStream, Self> {
        match self {
            Connection::Unix(s) => Ok(s),
            other => Err(other),
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Connection::Udp(s) => s.poll_recv(cx, buf),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Connection::Udp(s) => s.poll_send(cx, buf),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_flush(cx),
            Connection::Udp(_) => Poll::Ready(Ok(())),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Connection::Udp(_) => Poll::Ready(Ok(())),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
