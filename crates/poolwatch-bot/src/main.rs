//! poolwatch: pool solvency watcher entry point.
//!
//! Watches settlements and liquidations of one pool and alerts when a
//! position closes with less liquidity returned than was locked.

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Pool solvency watcher
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via POOLWATCH_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,

    /// Allow blocks up to this height to be checkpointed with undelivered alerts
    #[arg(long)]
    accept_alert_loss_through: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Determine config path: CLI arg > POOLWATCH_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("POOLWATCH_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    let mut config = poolwatch_bot::AppConfig::load(&config_path)?;
    if let Some(through) = args.accept_alert_loss_through {
        config.alert.accept_alert_loss_through = Some(through);
    }

    poolwatch_telemetry::init_logging(&config.telemetry.log_level)?;

    info!("Starting poolwatch v{}", env!("CARGO_PKG_VERSION"));
    info!(config_path = %config_path, "Configuration loaded");

    let app = poolwatch_bot::Application::new(config)?;
    let report = app.run().await?;

    info!(
        blocks_processed = report.blocks_processed,
        breaches = report.breaches,
        alerts_delivered = report.alerts_delivered,
        final_checkpoint = report.final_checkpoint,
        "poolwatch stopped"
    );

    Ok(())
}
