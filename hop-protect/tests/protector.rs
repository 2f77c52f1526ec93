//! End-to-end tests for the protection exchange against stub protectors.
//!
//! Each stub listens on a Unix socket inside a temporary directory and
//! misbehaves in one specific way.

use std::net::UdpSocket;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use hop_protect::{Error, Protect, Stage, UnixProtector};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;

#[derive(Clone, Copy)]
enum Stub {
    /// Receive the descriptor and reply with the given byte
    Reply(u8),
    /// Close the channel as soon as it is accepted
    CloseOnAccept,
    /// Read the request and never answer
    Silent,
}

fn spawn_stub(dir: &Path, behaviour: Stub) -> PathBuf {
    let path = dir.join("protect.sock");
    let listener = UnixListener::bind(&path).unwrap();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                match behaviour {
                    Stub::Reply(byte) => {
                        let fd = hop_protect::ancil::recv_fd(&stream).await.unwrap();
                        drop(fd);
                        stream.write_all(&[byte]).await.unwrap();
                    }
                    Stub::CloseOnAccept => drop(stream),
                    Stub::Silent => {
                        let mut buf = [0u8; 16];
                        let _ = stream.read(&mut buf).await;
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                }
            });
        }
    });

    path
}

#[tokio::test]
async fn test_any_ack_byte_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();

    for byte in [0x00, 0x01, 0xff] {
        let sub = dir.path().join(format!("{}", byte));
        std::fs::create_dir(&sub).unwrap();
        let path = spawn_stub(&sub, Stub::Reply(byte));

        UnixProtector::new(path)
            .protect(socket.as_raw_fd())
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_close_on_accept_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let path = spawn_stub(dir.path(), Stub::CloseOnAccept);
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();

    let start = Instant::now();
    let err = UnixProtector::new(path)
        .protect(socket.as_raw_fd())
        .await
        .unwrap_err();

    assert!(err.is_unavailable(), "unexpected error: {}", err);
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_silent_protector_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let path = spawn_stub(dir.path(), Stub::Silent);
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let limit = Duration::from_millis(300);

    let start = Instant::now();
    let err = UnixProtector::new(path)
        .with_timeout(limit)
        .protect(socket.as_raw_fd())
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(
        err,
        Error::ProtectorTimeout {
            stage: Stage::Acknowledge,
            ..
        }
    ));
    assert!(elapsed >= limit, "gave up after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "gave up after {:?}", elapsed);
}
