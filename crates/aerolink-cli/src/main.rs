//! AeroLink CLI
//!
//! Bridges a vehicle's cloud telemetry channel to local TCP/UDP sockets so
//! ground-control software without WebSocket support can use it.

use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use aerolink_core::{Relay, RelayConfig, relay_url};

/// AeroLink - bridge cloud vehicle telemetry to local sockets
#[derive(Parser)]
#[command(name = "aerolink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Device identifier of the vehicle to bridge
    #[arg(short, long, env = "AEROLINK_DEVICE")]
    device: String,

    /// Bearer token for the relay channel
    #[arg(short, long, env = "AEROLINK_TOKEN")]
    token: String,

    /// API base URL; `http(s)` is mapped to `ws(s)` automatically
    #[arg(
        long,
        env = "AEROLINK_API",
        default_value = "https://api.aerolink.dev"
    )]
    api: String,

    /// TCP listen address for ground-control clients
    #[arg(long, env = "AEROLINK_TCP", default_value = "127.0.0.1:14550")]
    tcp: SocketAddr,

    /// Disable the TCP listener
    #[arg(long)]
    no_tcp: bool,

    /// UDP listen address for ground-control clients (disabled unless given)
    #[arg(long, env = "AEROLINK_UDP")]
    udp: Option<SocketAddr>,

    /// Log level when RUST_LOG is not set (trace, debug, info, warn, error)
    #[arg(long, env = "AEROLINK_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let url = relay_url(&cli.api, &cli.device).context("invalid API base URL")?;

    let mut config = RelayConfig::new(url.clone(), cli.token);
    if !cli.no_tcp {
        config.stream_listen = Some(cli.tcp);
    }
    config.datagram_listen = cli.udp;
    if config.stream_listen.is_none() && config.datagram_listen.is_none() {
        anyhow::bail!("nothing to bridge: TCP disabled and no UDP address given");
    }

    println!("AeroLink bridge");
    println!("  device:   {}", cli.device);
    println!("  upstream: {url}");

    let relay = Relay::new(config);
    relay.start().await.context("relay startup failed")?;

    if let Some(addr) = relay.stream_local_addr().await {
        println!("  tcp:      {addr}");
    }
    if let Some(addr) = relay.datagram_local_addr().await {
        println!("  udp:      {addr}");
    }
    println!("press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("shutdown requested");
    relay.stop().await;
    Ok(())
}
