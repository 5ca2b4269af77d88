//! Duet Signal Server
//!
//! WebSocket relay that pairs two clients per room.
//!
//! # Usage
//!
//! ```bash
//! duet-signal --port 3000
//!
//! # Settings from a config file, with a flag override
//! duet-signal --config ./duet.toml --bind 127.0.0.1
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use duet_core::Config;
use duet_signal::SignalServer;

#[derive(Parser, Debug)]
#[command(name = "duet-signal")]
#[command(about = "Duet signaling relay for two-party rooms")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides the config file)
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Config file path (default: platform config directory)
    #[arg(short, long, env = "DUET_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    config.signal.validate()?;

    let bind = args.bind.unwrap_or(config.signal.bind);
    let port = args.port.unwrap_or(config.signal.port);
    let addr = SocketAddr::new(bind, port);

    info!("Starting Duet Signal Server");
    info!("  Listening on: ws://{}", addr);
    info!("  Health check: http://{}/health", addr);

    let server = SignalServer::new();

    // Handle Ctrl+C
    tokio::select! {
        result = server.serve(addr) => {
            if let Err(e) = result {
                error!("Signal server error: {:?}", e);
                return Err(e.into());
            }
        }
        _ = signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
