//! Sixtun provisioning API server
//!
//! Serves the tunnel provisioning API and executes the server-side
//! configuration commands against the host.

use clap::Parser;
use sixtun_common::{BrokerConfig, Database, ShellController};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod server;
mod tunnels;

use server::AppState;
use tunnels::TunnelService;

#[derive(Parser)]
#[command(name = "sixtun-web")]
#[command(about = "Sixtun provisioning API server")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/sixtun/config.toml")]
    config: PathBuf,

    /// Listen address override
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = BrokerConfig::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.api.listen = listen;
    }
    if config.api.key.is_empty() {
        warn!("No API key configured; the provisioning API is unauthenticated");
    }

    if let Some(parent) = config.db_path().parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::open(config.db_path())?;

    let netctl = Arc::new(ShellController);
    let service = TunnelService::new(db, config.clone(), netctl);
    if let Err(e) = service.ensure_wireguard_interface().await {
        warn!("WireGuard interface setup failed: {}", e);
    }

    let state = Arc::new(AppState {
        service,
        config: config.clone(),
    });
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(&config.api.listen).await?;
    info!(
        "Sixtun provisioning API v{} listening on {}",
        sixtun_common::VERSION,
        config.api.listen
    );
    axum::serve(listener, app).await?;

    Ok(())
}
