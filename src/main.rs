use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use smogping::agent::{Agent, Options};

/// Network monitoring with InfluxDB storage.
#[derive(Parser)]
#[command(name = "smogping", about, version)]
struct Cli {
    /// Path to the main configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Path to the targets file (may include other files).
    #[arg(short, long, default_value = "targets.toml")]
    targets: PathBuf,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output (implies verbose).
    #[arg(short, long)]
    debug: bool,

    /// Disable the alarm system.
    #[arg(long)]
    noalarm: bool,

    /// Disable alarm logging to the system log.
    #[arg(long)]
    nolog: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_new(format!("smogping={level}")).context("building log filter")?;
    fmt().with_env_filter(filter).with_target(true).init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let mut agent = Agent::new(Options {
        config_path: cli.config,
        targets_path: cli.targets,
        no_alarm: cli.noalarm,
        no_log: cli.nolog,
    })?;

    agent.start().await?;

    // Terminate and interrupt both trigger a graceful drain.
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    agent.stop().await;

    Ok(())
}
