//! TCP forwarding and stdin/stdout piping over the dialer

use std::time::Duration;

use anyhow::{Context, Result};
use hop_dial::{Connection, Dialer};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Accept TCP connections on `listen` and relay each one to `remote`
pub async fn forward(
    dialer: Dialer,
    listen: &str,
    remote: String,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to listen on {}", listen))?;
    info!(
        "Forwarding {} -> {} ({} mode)",
        listener.local_addr()?,
        remote,
        dialer.mode()
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((inbound, peer)) => {
                    let dialer = dialer.clone();
                    let remote = remote.clone();
                    tokio::spawn(async move {
                        if let Err(e) = relay(&dialer, inbound, &remote).await {
                            warn!("Relay {} -> {} failed: {:#}", peer, remote, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.recv() => {
                info!("Forwarder on {} shutting down", listen);
                return Ok(());
            }
        }
    }
}

async fn relay(dialer: &Dialer, mut inbound: TcpStream, remote: &str) -> Result<()> {
    let mut outbound = dialer
        .dial("tcp", remote)
        .await
        .with_context(|| format!("Failed to dial {}", remote))?;

    let (up, down) = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await?;
    debug!("Relay to {} closed: {} bytes up, {} bytes down", remote, up, down);
    Ok(())
}

/// Copy stdin to `conn` and `conn` to stdout until the remote side closes
pub async fn pipe_stdio(conn: Connection) -> Result<()> {
    let (mut reader, mut writer) = tokio::io::split(conn);
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    let upload = async {
        let sent = tokio::io::copy(&mut stdin, &mut writer).await?;
        writer.shutdown().await?;
        Ok::<_, std::io::Error>(sent)
    };
    {
        let download = tokio::io::copy(&mut reader, &mut stdout);
        tokio::pin!(download);

        tokio::select! {
            received = &mut download => {
                debug!("Remote closed after {} bytes", received?);
            }
            sent = upload => {
                debug!("Stdin closed after {} bytes", sent?);
                let received = download.await?;
                debug!("Remote closed after {} bytes", received);
            }
        }
    }

    stdout.flush().await?;
    Ok(())
}
