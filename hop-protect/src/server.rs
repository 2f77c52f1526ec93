//! Reference protector server
//!
//! Accepts protection requests on a Unix domain socket, applies a
//! [`SocketMarker`] to each received descriptor and acknowledges with a
//! single byte. A request that cannot be honoured is answered by closing the
//! channel without a reply, which clients treat as a failed protection.

use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::ancil;
use crate::error::{Error, Result};
use crate::{ACK, DEFAULT_PROTECT_TIMEOUT};

/// Exempts a socket from tunnel routing
pub trait SocketMarker: Send + Sync + 'static {
    /// Mark the socket referred to by `fd`
    fn mark(&self, fd: BorrowedFd<'_>) -> io::Result<()>;
}

/// Sets `SO_MARK` so policy routing rules can send the socket around the tunnel.
///
/// Requires `CAP_NET_ADMIN`.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwMark(pub u32);

#[cfg(any(target_os = "linux", target_os = "android"))]
impl SocketMarker for FwMark {
    fn mark(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        socket2::SockRef::from(&fd).set_mark(self.0)
    }
}

/// Counters kept by a running server
#[derive(Debug, Default)]
pub struct ServerStats {
    pub protected: AtomicU64,
    pub rejected: AtomicU64,
}

impl ServerStats {
    /// Number of acknowledged requests
    pub fn protected(&self) -> u64 {
        self.protected.load(Ordering::Relaxed)
    }

    /// Number of requests closed without acknowledgment
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Protector listening on a Unix domain socket
pub struct ProtectServer<M> {
    listener: UnixListener,
    path: PathBuf,
    marker: Arc<M>,
    stats: Arc<ServerStats>,
    request_timeout: Duration,
}

impl<M: SocketMarker> ProtectServer<M> {
    /// Bind the server, replacing a stale socket file at `path`
    pub fn bind(path: impl AsRef<Path>, marker: M) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Remove existing socket file
        let _ = std::fs::remove_file(&path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let listener = UnixListener::bind(&path)?;

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&path, perms);
        }

        log::info!("Protector listening on {:?}", path);

        Ok(Self {
            listener,
            path,
            marker: Arc::new(marker),
            stats: Arc::new(ServerStats::default()),
            request_timeout: DEFAULT_PROTECT_TIMEOUT,
        })
    }

    /// Bound on how long a client may take to deliver its descriptor
    pub fn with_request_timeout(mut self, limit: Duration) -> Self {
        self.request_timeout = limit;
        self
    }

    /// Socket path the server is bound to
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Shared counters, valid while and after the server runs
    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    /// Serve requests until a shutdown signal arrives
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let marker = self.marker.clone();
                        let stats = self.stats.clone();
                        let limit = self.request_timeout;
                        tokio::spawn(async move {
                            if let Err(e) = handle_request(stream, marker.as_ref(), &stats, limit).await {
                                log::debug!("Protect request error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        log::warn!("Protector accept error: {}", e);
                    }
                },
                _ = shutdown.recv() => {
                    log::info!("Protector on {:?} shutting down", self.path);
                    return Ok(());
                }
            }
        }
    }
}

impl<M> Drop for ProtectServer<M> {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle_request<M: SocketMarker>(
    mut stream: UnixStream,
    marker: &M,
    stats: &ServerStats,
    limit: Duration,
) -> Result<()> {
    let fd = match timeout(limit, ancil::recv_fd(&stream)).await {
        Ok(Ok(fd)) => fd,
        Ok(Err(e)) => {
            stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        Err(_) => {
            stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(Error::Protocol("request timed out".into()));
        }
    };

    if let Err(e) = marker.mark(fd.as_fd()) {
        stats.rejected.fetch_add(1, Ordering::Relaxed);
        log::warn!("Failed to mark received socket: {}", e);
        return Err(Error::Io(e));
    }

    // The received copy is closed once acknowledged; the client keeps its own.
    stream.write_all(&[ACK]).await?;
    drop(fd);
    stats.protected.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Protect, UnixProtector};
    use std::net::{SocketAddr, UdpSocket};
    use std::os::fd::AsRawFd;
    use std::sync::Mutex;

    /// Records the local address of every socket it is asked to mark
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<SocketAddr>>,
    }

    impl SocketMarker for Arc<Recorder> {
        fn mark(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
            let addr = socket2::SockRef::from(&fd).local_addr()?;
            self.seen.lock().unwrap().extend(addr.as_socket());
            Ok(())
        }
    }

    struct Refuse;

    impl SocketMarker for Refuse {
        fn mark(&self, _fd: BorrowedFd<'_>) -> io::Result<()> {
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        }
    }

    #[tokio::test]
    async fn test_server_marks_and_acknowledges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("protect.sock");
        let recorder = Arc::new(Recorder::default());

        let server = ProtectServer::bind(&path, recorder.clone()).unwrap();
        let stats = server.stats();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(server.run(shutdown_rx));

        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        UnixProtector::new(&path)
            .protect(udp.as_raw_fd())
            .await
            .unwrap();

        assert_eq!(
            recorder.seen.lock().unwrap().as_slice(),
            &[udp.local_addr().unwrap()]
        );
        assert_eq!(stats.protected(), 1);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_refused_mark_closes_without_ack() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("protect.sock");

        let server = ProtectServer::bind(&path, Refuse).unwrap();
        let stats = server.stats();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(server.run(shutdown_rx));

        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let err = UnixProtector::new(&path)
            .protect(udp.as_raw_fd())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ProtectorClosed { .. }));
        assert_eq!(stats.rejected(), 1);
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("protect.sock");
        std::fs::write(&path, b"stale").unwrap();

        let server = ProtectServer::bind(&path, Refuse).unwrap();
        assert_eq!(server.path(), path.as_path());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    #[ignore] // needs CAP_NET_ADMIN
    async fn test_privileged_fwmark() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("protect.sock");

        let server = ProtectServer::bind(&path, FwMark(0x1234)).unwrap();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(server.run(shutdown_rx));

        let socket = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None)
            .unwrap();
        UnixProtector::new(&path)
            .protect(socket.as_raw_fd())
            .await
            .unwrap();

        assert_eq!(socket.mark().unwrap(), 0x1234);
    }
}
