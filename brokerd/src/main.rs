//! Broker daemon for a family of backend data servers.
//!
//! Clients address requests by protocol + logical path; the broker resolves
//! the address to an executable and canonical port, launches the backend on
//! demand (once, even under concurrent demand), waits for it to become
//! reachable, and replies with the corrected address so the client can talk
//! to the backend directly.

mod admin;
mod config;
mod error;
mod health;
mod launcher;
mod lookup;
mod message;
mod pending;
mod reaper;
mod router;
mod server;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::admin::AdminHandler;
use crate::config::{BrokerConfig, Timeouts};
use crate::health::HealthChecker;
use crate::pending::PendingRegistry;
use crate::reaper::Reaper;
use crate::router::Router;
use crate::server::Broker;

const IDLE_TICK: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "brokerd", version)]
#[command(about = "Broker daemon that activates backend data servers on demand")]
struct Cli {
    /// Path to the broker configuration (brokerd.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind address override (host:port)
    #[arg(long)]
    bind: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("BROKERD_CONFIG").ok().map(PathBuf::from))
        .or_else(|| {
            let candidate = std::env::current_dir().ok()?.join("brokerd.toml");
            if candidate.is_file() {
                Some(candidate)
            } else {
                None
            }
        });

    let mut config = match config_path {
        Some(path) => {
            info!("Loading config from {}", path.display());
            BrokerConfig::load(&path)?
        }
        None => {
            warn!("No config file found, using built-in defaults");
            BrokerConfig::default()
        }
    };
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if config.services.is_empty() {
        warn!("No services configured; every data request will be refused");
    }

    // Read once at startup; later environment changes are ignored.
    let timeouts = Timeouts::from_env();
    info!(
        ping_timeout_ms = timeouts.ping.as_millis() as u64,
        comm_timeout_ms = timeouts.comm.as_millis() as u64,
        "Timeouts configured"
    );

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!("brokerd listening on {}", config.bind);

    let health = HealthChecker::new(timeouts, config.poll_interval());
    let pending = PendingRegistry::new();
    let reaper = Reaper::new();
    let router = Router::new(&config, health, pending);
    let broker = Arc::new(Broker::new(
        router,
        AdminHandler::new(reaper.clone()),
        reaper,
        config.max_clients,
    ));

    // Idle tick: reaps children and reports quiescence. The broker never
    // exits on quiescence, unlike the backends it manages.
    let ticker = broker.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(IDLE_TICK);
        loop {
            interval.tick().await;
            ticker.idle_tick();
        }
    });

    tokio::select! {
        result = broker.serve(listener) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down");
            Ok(())
        }
    }
}
