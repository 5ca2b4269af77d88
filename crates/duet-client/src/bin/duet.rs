//! Duet call client
//!
//! # Usage
//!
//! ```bash
//! # Join a room and report connection quality every 5 seconds
//! duet join lobby --signal ws://127.0.0.1:3000 --report-secs 5
//!
//! # Print a config file with every default spelled out
//! duet config > ~/.config/duet/config.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use duet_client::{connect, RtcTransportFactory, Session, StaticMediaSource};
use duet_core::Config;

#[derive(Parser, Debug)]
#[command(name = "duet")]
#[command(about = "Two-party calls with connection-quality telemetry")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Join a room and run a call
    Join {
        /// Room to join
        room: String,

        /// Signal server URL (overrides the config file)
        #[arg(short, long)]
        signal: Option<String>,

        /// Config file path (default: platform config directory)
        #[arg(short, long, env = "DUET_CONFIG")]
        config: Option<PathBuf>,

        /// Seconds between quality reports
        #[arg(long, default_value = "5")]
        report_secs: u64,
    },

    /// Print the default configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    match cli.command {
        Commands::Join {
            room,
            signal,
            config,
            report_secs,
        } => join(room, signal, config, report_secs).await,
        Commands::Config => {
            print!("{}", Config::sample());
            Ok(())
        }
    }
}

async fn join(
    room: String,
    signal_url: Option<String>,
    config_path: Option<PathBuf>,
    report_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    config.validate()?;

    let url = signal_url.unwrap_or_else(|| config.client.signal_url.clone());
    info!("Connecting to {} for room {}", url, room);

    let mut link = connect(&url).await?;
    let factory = Arc::new(RtcTransportFactory::new(config.client.ice_servers.clone()));
    let mut session = Session::new(
        room,
        &config,
        factory,
        Arc::new(StaticMediaSource::default()),
        link.outbound.clone(),
    )?;

    // Periodic quality report
    let mut snapshots = session.subscribe();
    let reporter = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(report_secs.max(1)));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if snapshots.has_changed().is_err() {
                break;
            }
            let snapshot = snapshots.borrow_and_update().clone();
            info!(
                "Quality {} (score {}/6): rtt {:.1}ms avg, probe rtt {:.1}ms, jitter {:.1}ms, loss {:.1}%, frame delay {:.1}ms, outbound {:.0} kbps",
                snapshot.overall,
                snapshot.score,
                snapshot.rtt.average,
                snapshot.probe_rtt.average,
                snapshot.rtt.std_dev,
                snapshot.packet_loss_percent,
                snapshot.frame_delay.average,
                snapshot.average_kbps.unwrap_or(0.0)
            );
        }
    });

    let shutdown = async {
        let _ = signal::ctrl_c().await;
        info!("Shutting down...");
    };
    let result = session.run(&mut link.inbound, shutdown).await;

    // Let the leave message reach the server before closing
    drop(session);
    drop(link.outbound);
    tokio::time::sleep(Duration::from_millis(100)).await;
    reporter.abort();

    if let Err(e) = result {
        error!("Session ended: {}", e);
        return Err(e.into());
    }
    Ok(())
}
