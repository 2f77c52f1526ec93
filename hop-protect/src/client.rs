//! Client side of the protection exchange

use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::time::timeout;

use crate::ancil;
use crate::error::{Error, Result, Stage};
use crate::{Protect, DEFAULT_PROTECT_PATH, DEFAULT_PROTECT_TIMEOUT};

/// Protects descriptors by handing them to a protector listening on a Unix socket.
///
/// Every call opens its own channel, so one instance can be shared by any
/// number of concurrent dials.
#[derive(Debug, Clone)]
pub struct UnixProtector {
    path: PathBuf,
    timeout: Duration,
}

impl UnixProtector {
    /// Create a protector client for the given channel path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: DEFAULT_PROTECT_TIMEOUT,
        }
    }

    /// Set the bound applied to each step of the exchange
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Channel path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Per-step timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn exchange(&self, fd: RawFd) -> Result<u8> {
        let stream = match timeout(self.timeout, UnixStream::connect(&self.path)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(Error::ProtectorUnreachable {
                    path: self.path.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(Error::ProtectorTimeout {
                    fd,
                    stage: Stage::Connect,
                })
            }
        };

        match timeout(self.timeout, ancil::send_fd(&stream, fd)).await {
            Ok(Ok(())) => {}
            Ok(Err(source)) => return Err(Error::ProtectorSend { fd, source }),
            Err(_) => {
                return Err(Error::ProtectorTimeout {
                    fd,
                    stage: Stage::Send,
                })
            }
        }

        read_ack(stream, fd, self.timeout).await
    }
}

impl Default for UnixProtector {
    fn default() -> Self {
        Self::new(DEFAULT_PROTECT_PATH)
    }
}

/// Read the single acknowledgment byte; the stream is dropped on return.
async fn read_ack(mut stream: UnixStream, fd: RawFd, limit: Duration) -> Result<u8> {
    let mut ack = [0u8; 1];
    match timeout(limit, stream.read(&mut ack)).await {
        Ok(Ok(1)) => Ok(ack[0]),
        Ok(Ok(_)) => Err(Error::ProtectorClosed { fd }),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => {
            Err(Error::ProtectorClosed { fd })
        }
        Ok(Err(e)) => Err(Error::Io(e)),
        Err(_) => Err(Error::ProtectorTimeout {
            fd,
            stage: Stage::Acknowledge,
        }),
    }
}

#[async_trait]
impl Protect for UnixProtector {
    async fn protect(&self, fd: RawFd) -> Result<()> {
        match self.exchange(fd).await {
            Ok(ack) => {
                log::debug!("Protected fd {} (ack {:#04x})", fd, ack);
                Ok(())
            }
            Err(e) => {
                log::debug!("Protect exchange for fd {} on {:?} failed: {}", fd, self.path, e);
                Err(e)
            }
        }
    }
}
