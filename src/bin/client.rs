//! Veilway local endpoint
//!
//! Runs the SOCKS5 and HTTP proxy servers on the user's machine and carries
//! tunneled streams to the remote endpoint over pooled TLS transports.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use veilway::config::Config;
use veilway::local::LocalServer;
use veilway::stats::{Statistics, StatsReporter};

/// Veilway local endpoint - encrypted tunneling proxy
#[derive(Parser, Debug)]
#[command(name = "veilway-local")]
#[command(about = "Veilway local endpoint - SOCKS5/HTTP proxy over an encrypted tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Remote server address (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Remote server port (overrides config)
    #[arg(long)]
    server_port: Option<u16>,

    /// Local SOCKS5 port (overrides config)
    #[arg(short, long)]
    local_port: Option<u16>,

    /// Listen on all interfaces instead of loopback
    #[arg(long)]
    bind_all: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    let config = Config::load(&args.config).context("Failed to load configuration")?;

    let mut client_config = config
        .client
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;

    if let Some(server) = args.server {
        client_config.server = server;
    }
    if let Some(port) = args.server_port {
        client_config.server_port = port;
    }
    if let Some(port) = args.local_port {
        client_config.local_port = port;
    }
    if args.bind_all {
        client_config.bind_all = true;
    }

    info!("Veilway local endpoint v{}", veilway::VERSION);
    info!("Remote: {}", client_config.server_addr());
    info!("SOCKS5 proxy: {}", client_config.socks_addr());
    info!("HTTP proxy: {}", client_config.http_proxy_addr());

    let stats = Statistics::new();
    let reporter = StatsReporter::spawn(Arc::clone(&stats), Duration::from_secs(3600));

    let server = LocalServer::new(client_config, Arc::clone(&stats))
        .await
        .context("Failed to initialize local endpoint")?;

    let run = Arc::clone(&server);
    tokio::select! {
        result = run.run() => {
            reporter.shutdown();
            result.context("Local endpoint failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            server.shutdown().await;
            reporter.shutdown();
        }
    }

    Ok(())
}
