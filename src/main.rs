use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use flowstat::models::config::AppConfig;
use flowstat::pipeline::Pipeline;
use flowstat::utils::logging;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Per-flow traffic statistics from captured packets")]
struct Args {
    /// YAML configuration file; FLOWSTAT_* environment variables override it
    #[clap(short, long, default_value = "config.yml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error, off)
    #[clap(long, default_value = "info")]
    log_level: String,

    /// Exit once every record has been delivered (backlog upload runs)
    #[clap(long)]
    exit_when_drained: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    logging::init_logger(logging::get_log_level(&args.log_level));

    info!("Starting flowstat v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config.display()))?;

    let pipeline = Pipeline::build(&config, args.exit_when_drained)
        .context("failed to start the pipeline")?;

    let stop = CancellationToken::new();
    let signal = stop.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received interrupt, shutting down");
                signal.cancel();
            }
            Err(e) => error!("Failed to listen for interrupt: {}", e),
        }
    });

    let delivered = pipeline.run(stop).await;
    info!("flowstat stopped after {} event(s)", delivered);
    Ok(())
}
