//! hop-protect - socket protection for processes running inside a VPN
//!
//! A process whose own traffic feeds a VPN tunnel has to exempt its upstream
//! sockets from that tunnel, otherwise the tunnel loops back into itself.
//! The exemption is granted by a privileged *protector* process: before a
//! socket is connected its descriptor is passed to the protector over a Unix
//! domain socket (`SCM_RIGHTS`), the protector marks it and answers with a
//! single byte.
//!
//! ```text
//!   dialer                          protector
//!     │  socket()                       │
//!     │── connect(protect_path) ───────▶│
//!     │── '!' + SCM_RIGHTS[fd] ────────▶│  mark(fd)
//!     │◀──────────────────── 1 byte ────│
//!     │  connect(remote)                │
//! ```
//!
//! # Example
//!
//! ```no_run
//! use hop_protect::{Protect, UnixProtector};
//! use std::os::fd::AsRawFd;
//!
//! # async fn example() -> hop_protect::Result<()> {
//! let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
//! UnixProtector::new("protect_path")
//!     .protect(socket.as_raw_fd())
//!     .await?;
//! # Ok(())
//! # }
//! ```

#[cfg(unix)]
pub mod ancil;
#[cfg(unix)]
mod client;
mod error;
#[cfg(unix)]
mod server;

use std::time::Duration;

use async_trait::async_trait;

#[cfg(unix)]
pub use client::UnixProtector;
pub use error::{Error, Result, Stage};
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use server::FwMark;
#[cfg(unix)]
pub use server::{ProtectServer, ServerStats, SocketMarker};

/// Channel path used when none is configured, relative to the working directory
pub const DEFAULT_PROTECT_PATH: &str = "protect_path";

/// Bound on each step of the protection exchange
pub const DEFAULT_PROTECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Byte sent by the reference server to acknowledge a request
pub const ACK: u8 = 0x01;

/// Raw OS handle of a socket
#[cfg(unix)]
pub type RawSocketHandle = std::os::fd::RawFd;

/// Raw OS handle of a socket
#[cfg(windows)]
pub type RawSocketHandle = std::os::windows::io::RawSocket;

/// Capability to exempt a socket from VPN routing.
///
/// Implementations receive the raw handle of a socket that has been created
/// but not yet connected. Returning `Ok` allows the dial to proceed; any error
/// aborts it.
#[async_trait]
pub trait Protect: Send + Sync {
    /// Protect the socket behind `fd`
    async fn protect(&self, fd: RawSocketHandle) -> Result<()>;
}
