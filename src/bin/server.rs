//! Veilway remote endpoint
//!
//! Accepts authenticated tunnel transports, dials announced targets, and
//! relays streams. Presents a self-signed TLS certificate unless one is
//! configured.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use veilway::config::Config;
use veilway::remote::RemoteServer;
use veilway::stats::{Statistics, StatsReporter};

/// Veilway remote endpoint - encrypted tunneling proxy
#[derive(Parser, Debug)]
#[command(name = "veilway-remote")]
#[command(about = "Veilway remote endpoint - decrypts tunnel streams and relays to targets")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listen port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

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

    let mut server_config = config
        .server
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;

    if let Some(port) = args.port {
        server_config.server_port = port;
    }

    info!("Veilway remote endpoint v{}", veilway::VERSION);
    info!("Listening on {}", server_config.listen_addr());

    let stats = Statistics::new();
    let reporter = StatsReporter::spawn(Arc::clone(&stats), Duration::from_secs(3600));

    let server = RemoteServer::new(server_config, Arc::clone(&stats))
        .context("Failed to initialize remote endpoint")?;

    tokio::select! {
        result = server.run() => {
            reporter.shutdown();
            result.context("Remote endpoint failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            reporter.shutdown();
        }
    }

    Ok(())
}
