//! Descriptor passing over Unix stream sockets
//!
//! A protection request is a single marker byte carrying one `SCM_RIGHTS`
//! control message with the descriptor to protect. Both sides drive the
//! raw `sendmsg`/`recvmsg` calls through tokio's readiness API so the
//! exchange never blocks a runtime worker.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};
use tokio::io::Interest;
use tokio::net::UnixStream;

use crate::error::{Error, Result};

/// Payload byte that accompanies the descriptor
pub const MARKER: u8 = b'!';

#[cfg(any(target_os = "linux", target_os = "android"))]
fn send_flags() -> MsgFlags {
    MsgFlags::MSG_NOSIGNAL
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn send_flags() -> MsgFlags {
    MsgFlags::empty()
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn recv_flags() -> MsgFlags {
    MsgFlags::MSG_CMSG_CLOEXEC
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn recv_flags() -> MsgFlags {
    MsgFlags::empty()
}

/// Send `fd` to the peer as ancillary data alongside [`MARKER`].
pub async fn send_fd(stream: &UnixStream, fd: RawFd) -> io::Result<()> {
    let sock = stream.as_raw_fd();
    let payload = [MARKER];
    let fds = [fd];

    loop {
        stream.writable().await?;

        let iov = [IoSlice::new(&payload)];
        let cmsgs = [ControlMessage::ScmRights(&fds)];

        #[allow(unreachable_patterns)] // EAGAIN == EWOULDBLOCK on some platforms
        let result = stream.try_io(Interest::WRITABLE, || {
            match sendmsg::<UnixAddr>(sock, &iov, &cmsgs, send_flags(), None) {
                Ok(n) => Ok(n),
                Err(Errno::EAGAIN) | Err(Errno::EWOULDBLOCK) => {
                    Err(io::Error::from(io::ErrorKind::WouldBlock))
                }
                Err(e) => Err(io::Error::from(e)),
            }
        });

        match result {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "marker byte not sent",
                ))
            }
            Ok(_) => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Outcome of a single `recvmsg` call
struct Received {
    bytes: usize,
    fds: Vec<RawFd>,
    truncated: bool,
}

/// Receive one descriptor sent with [`send_fd`].
///
/// Exactly one payload byte and exactly one descriptor are expected; any
/// other framing is a protocol error and every descriptor that did arrive is
/// closed before returning.
pub async fn recv_fd(stream: &UnixStream) -> Result<OwnedFd> {
    let sock = stream.as_raw_fd();

    let received = loop {
        stream.readable().await?;

        let mut payload = [0u8; 1];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);

        #[allow(unreachable_patterns)] // EAGAIN == EWOULDBLOCK on some platforms
        let result = stream.try_io(Interest::READABLE, || {
            let mut iov = [IoSliceMut::new(&mut payload)];
            match recvmsg::<UnixAddr>(sock, &mut iov, Some(&mut cmsg_buf), recv_flags()) {
                Ok(msg) => {
                    let mut fds = Vec::new();
                    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                        if let ControlMessageOwned::ScmRights(rights) = cmsg {
                            fds.extend(rights);
                        }
                    }
                    Ok(Received {
                        bytes: msg.bytes,
                        fds,
                        truncated: msg.flags.contains(MsgFlags::MSG_CTRUNC),
                    })
                }
                Err(Errno::EAGAIN) | Err(Errno::EWOULDBLOCK) => {
                    Err(io::Error::from(io::ErrorKind::WouldBlock))
                }
                Err(e) => Err(io::Error::from(e)),
            }
        });

        match result {
            Ok(received) => break received,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    };

    // SAFETY: SCM_RIGHTS installs fresh descriptors owned by this process.
    let mut owned: Vec<OwnedFd> = received
        .fds
        .into_iter()
        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
        .collect();

    if received.bytes == 0 {
        return Err(Error::Protocol(
            "channel closed before a descriptor arrived".into(),
        ));
    }
    if received.truncated {
        return Err(Error::Protocol("control data truncated".into()));
    }
    match owned.len() {
        1 => Ok(owned.remove(0)),
        0 => Err(Error::Protocol("request carried no descriptor".into())),
        n => Err(Error::Protocol(format!(
            "request carried {} descriptors, expected 1",
            n
        ))),
    }
}
