//! Sixtun tunnel recovery
//!
//! Runs once at boot: compares the broker's persisted inventory with live
//! kernel/WireGuard state and recreates whatever is missing.

use clap::Parser;
use sixtun_common::{BrokerConfig, ShellController};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod client;
mod reconciler;

use client::ApiClient;
use reconciler::Reconciler;

#[derive(Parser)]
#[command(name = "sixtun-recovery")]
#[command(about = "Boot-time tunnel reconciliation")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/sixtun/config.toml")]
    config: PathBuf,

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

    info!("Starting tunnel recovery");
    let config = BrokerConfig::load(&cli.config)?;

    let client = ApiClient::new(&config.api.listen, &config.api.key);
    let reconciler = Reconciler::new(config, Arc::new(ShellController));
    let summary = reconciler.run(&client).await?;

    info!(
        "Recovery finished: {} in inventory, {} recreated, {} failed",
        summary.inventory, summary.recreated, summary.failed
    );
    Ok(())
}
