use clap::Parser;
use ipxbridge::capture::PcapCapture;
use ipxbridge::config::Config;
use ipxbridge::engine::RelayEngine;
use ipxbridge::logbuf::{BufferLayer, LogBuffer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// IPX/SPX bridging daemon: captures IPX frames locally and relays them to
/// peer nodes over TLS.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "/etc/ipxbridge.json")]
    config: PathBuf,

    /// Network interface to capture from
    #[arg(long)]
    interface: Option<String>,

    /// Peer listen address
    #[arg(long)]
    listen: Option<String>,

    /// Disable TLS on peer links (debug only)
    #[arg(long)]
    disable_ssl: bool,

    /// Run with synthetic peers and traffic instead of live capture
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = Cli::parse();

    let (mut cfg, load_warning) = match Config::load(&cli.config) {
        Ok(cfg) => (cfg, None),
        Err(e) => (Config::default(), Some(e)),
    };

    // Flags override the file.
    if let Some(iface) = &cli.interface {
        cfg.interface = iface.clone();
    }
    if let Some(listen) = &cli.listen {
        cfg.listen_addr = listen.clone();
    }
    if cli.disable_ssl {
        cfg.disable_ssl = true;
    }

    let logs = LogBuffer::new();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(BufferLayer::new(logs.clone()))
        .init();

    if let Some(e) = load_warning {
        warn!(
            "failed to load config from {}: {}. Using defaults.",
            cli.config.display(),
            e
        );
    }

    let capture = Arc::new(PcapCapture::new(cfg.interface.clone()));
    let cancel = CancellationToken::new();
    let engine = RelayEngine::new(cfg, Some(cli.config.clone()), capture, logs, cancel.clone())?;

    if cli.demo {
        engine.set_demo_mode(true);
    }

    engine.clone().start().await?;

    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
    }

    cancel.cancel();
    // Give links and the listener a beat to unwind before the runtime drops.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    Ok(())
}
