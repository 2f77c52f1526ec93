//! ruhop-dial
//!
//! Command line front end for the protected dialer: a TCP forwarder that
//! also runs as a SIP003 plugin, diagnostics, and a reference protector.

mod plugin;
mod relay;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hop_dial::{Config, Dialer, Resolve};
use plugin::PluginEnv;

/// Dial outbound connections around a VPN tunnel
#[derive(Parser)]
#[command(name = "ruhop-dial")]
#[command(author, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable debug log
    #[arg(short = 'D', long, global = true)]
    debug: bool,

    /// VPN mode: protect every outbound socket before it connects
    #[arg(short = 'V', long, global = true)]
    vpn: bool,

    /// Unix socket of the protector
    #[arg(long, global = true)]
    protect_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Relay TCP connections from a local address to a remote one
    Forward {
        /// Local listen address
        #[arg(short = 'L', long)]
        listen: String,

        /// Remote address (host:port)
        #[arg(short = 'F', long)]
        remote: String,
    },

    /// Dial an address and connect it to stdin/stdout
    Connect {
        /// Network: tcp, tcp4, tcp6, udp, udp4, udp6 or unix
        #[arg(short, long, default_value = "tcp")]
        network: String,

        /// Address to dial (host:port, or a path for unix)
        address: String,

        /// Give up if resolution and connect take longer (seconds)
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Resolve a host name the way dials do
    Resolve {
        /// Host name to look up
        host: String,
    },

    /// Run a reference protector on a Unix socket
    Protector {
        /// Socket path (defaults to the configured protect path)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Firewall mark for protected sockets (Linux, needs CAP_NET_ADMIN)
        #[arg(long)]
        mark: Option<u32>,
    },

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "ruhop-dial.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let (plugin, extra_args) = PluginEnv::from_env();
    let cli = Cli::parse_from(plugin::extend_args(std::env::args_os(), extra_args));

    let config = load_config(&cli)?;

    // Initialize logging
    let level = if cli.debug {
        "debug".to_string()
    } else {
        cli.log_level
            .clone()
            .unwrap_or_else(|| config.common.log_level.clone())
    };
    init_logging(&level);

    match cli.command {
        Some(Commands::Forward { listen, remote }) => run_forward(&config, &listen, remote).await,
        Some(Commands::Connect {
            network,
            address,
            timeout,
        }) => run_connect(&config, &network, &address, timeout).await,
        Some(Commands::Resolve { host }) => run_resolve(&config, &host).await,
        Some(Commands::Protector { path, mark }) => {
            let path = path.unwrap_or_else(|| PathBuf::from(&config.protect.path));
            run_protector(path, mark).await
        }
        Some(Commands::GenConfig { output }) => generate_config(output),
        None => match plugin {
            Some(env) => {
                info!("Running as SIP003 plugin");
                run_forward(&config, &env.local, env.remote).await
            }
            None => bail!("Can only be used as a shadowsocks plugin without a subcommand, see --help"),
        },
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Configuration file, if any, with the command line overrides applied
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?,
        None => Config::default(),
    };

    if cli.vpn {
        config.protect.vpn_mode = true;
    }
    if let Some(path) = &cli.protect_path {
        config.protect.path = path.to_string_lossy().into_owned();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn build_dialer(config: &Config) -> Result<Dialer> {
    let dialer = Dialer::from_config(config).context("Failed to set up dialer")?;
    info!("Dialer mode: {}", dialer.mode());
    Ok(dialer)
}

async fn run_forward(config: &Config, listen: &str, remote: String) -> Result<()> {
    let dialer = build_dialer(config)?;
    let stats = dialer.stats().clone();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let listen = listen.to_string();
    let mut forward_handle =
        tokio::spawn(async move { relay::forward(dialer, &listen, remote, shutdown_rx).await });

    tokio::select! {
        // The forwarder only returns early when it could not start
        result = &mut forward_handle => {
            result.context("Forwarder task failed")??;
            return Ok(());
        }
        result = wait_for_shutdown() => result?,
    }

    info!("Shutting down forwarder...");
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(Duration::from_secs(5), forward_handle).await {
        Ok(Ok(Err(e))) => error!("Forwarder error: {:#}", e),
        Ok(Err(e)) => error!("Forwarder task failed: {}", e),
        Ok(Ok(Ok(()))) | Err(_) => {}
    }

    info!("Dial stats: {}", stats.snapshot());
    Ok(())
}

async fn run_connect(
    config: &Config,
    network: &str,
    address: &str,
    timeout: Option<u64>,
) -> Result<()> {
    let dialer = build_dialer(config)?;

    let conn = match timeout {
        Some(secs) => {
            dialer
                .dial_timeout(network, address, Duration::from_secs(secs))
                .await
        }
        None => dialer.dial(network, address).await,
    }
    .with_context(|| format!("Failed to dial {} {}", network, address))?;

    if let Ok(Some(peer)) = conn.peer_addr() {
        info!("Connected to {}", peer);
    }
    relay::pipe_stdio(conn).await?;

    info!("Dial stats: {}", dialer.stats().snapshot());
    Ok(())
}

async fn run_resolve(config: &Config, host: &str) -> Result<()> {
    let dialer = build_dialer(config)?;

    let addrs = dialer
        .resolver()
        .lookup_ip(host)
        .await
        .with_context(|| format!("Failed to resolve {}", host))?;

    for addr in addrs {
        println!("{}", addr);
    }

    info!("Dial stats: {}", dialer.stats().snapshot());
    Ok(())
}

#[cfg(unix)]
async fn run_protector(path: PathBuf, mark: Option<u32>) -> Result<()> {
    match mark {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        Some(mark) => serve_protector(path, hop_protect::FwMark(mark)).await,
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        Some(_) => bail!("--mark is only supported on Linux"),
        None => serve_protector(path, AcceptAll).await,
    }
}

#[cfg(not(unix))]
async fn run_protector(_path: PathBuf, _mark: Option<u32>) -> Result<()> {
    bail!("The protector needs Unix domain sockets")
}

/// Acknowledges every socket without touching it
#[cfg(unix)]
struct AcceptAll;

#[cfg(unix)]
impl hop_protect::SocketMarker for AcceptAll {
    fn mark(&self, fd: std::os::fd::BorrowedFd<'_>) -> std::io::Result<()> {
        use std::os::fd::AsRawFd;
        tracing::debug!("Accepting socket {}", fd.as_raw_fd());
        Ok(())
    }
}

#[cfg(unix)]
async fn serve_protector<M: hop_protect::SocketMarker>(path: PathBuf, marker: M) -> Result<()> {
    let server = hop_protect::ProtectServer::bind(&path, marker)
        .with_context(|| format!("Failed to bind protector at {:?}", path))?;
    let stats = server.stats();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let mut server_handle = tokio::spawn(server.run(shutdown_rx));

    tokio::select! {
        result = &mut server_handle => {
            result.context("Protector task failed")??;
            return Ok(());
        }
        result = wait_for_shutdown() => result?,
    }

    info!("Shutting down protector...");
    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!(
        "Protector stats: protected={} rejected={}",
        stats.protected(),
        stats.rejected()
    );
    Ok(())
}

fn generate_config(output: PathBuf) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to register SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("Failed to register SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "ruhop-dial",
            "forward",
            "-L",
            "127.0.0.1:1080",
            "-F",
            "example.com:443",
            "-V",
            "--protect-path=/tmp/protect_path",
        ])
        .unwrap();
        assert!(cli.vpn);
        assert!(matches!(cli.command, Some(Commands::Forward { .. })));

        let config = load_config(&cli).unwrap();
        assert!(config.protect.vpn_mode);
        assert_eq!(config.protect.path, "/tmp/protect_path");
    }

    #[test]
    fn test_plugin_mode_has_no_subcommand() {
        let cli = Cli::try_parse_from(["ruhop-dial", "-V", "-D"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.debug);
    }

    #[test]
    fn test_plugin_options_parse_without_subcommand() {
        let vars = [
            ("SS_LOCAL_HOST", "127.0.0.1"),
            ("SS_LOCAL_PORT", "1080"),
            ("SS_REMOTE_HOST", "203.0.113.7"),
            ("SS_REMOTE_PORT", "8388"),
            (
                "SS_PLUGIN_OPTIONS",
                "-V --protect-path\\=/run/ruhop/#SS_HOST-#SS_PORT.sock",
            ),
        ];
        let (env, extra) = PluginEnv::from_vars(|name| {
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        });
        assert!(env.is_some());

        let args = plugin::extend_args([std::ffi::OsString::from("ruhop-dial")], extra);
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.vpn);
        assert_eq!(
            cli.protect_path,
            Some(PathBuf::from("/run/ruhop/203.0.113.7-8388.sock"))
        );
    }

    #[test]
    fn test_config_file_with_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ruhop-dial.toml");
        std::fs::write(&path, "[dns]\noverride = false\n").unwrap();

        let cli = Cli::try_parse_from([
            "ruhop-dial",
            "-c",
            path.to_str().unwrap(),
            "resolve",
            "localhost",
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();
        assert!(!config.dns.override_system);
        assert!(!config.protect.vpn_mode);
    }
}
