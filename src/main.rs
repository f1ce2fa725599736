//==============================================================================
// Main Entry Point
//==============================================================================

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use redflow::config;
use redflow::Supervisor;

/// A Redis-protocol sharding proxy.
#[derive(Debug, Parser)]
#[command(name = "redflow", version, about)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short = 'l', long = "log-level", default_value = "info")]
    log_level: String,
}

fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let active = match config::load_from_path(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("invalid config {}: {error}", cli.config.display());
            return ExitCode::from(1);
        }
    };

    // Single OS thread, cooperative scheduling at `.await` points only,
    // matching the single-threaded reactor this proxy is built around.
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("failed to start tokio runtime: {error}");
            return ExitCode::from(1);
        }
    };

    if let Err(error) = runtime.block_on(run(active)) {
        error!(%error, "redflow exited with an error");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

async fn run(active: config::Config) -> Result<()> {
    info!("starting redflow");
    let supervisor = Supervisor::new(active);
    // `SHUTDOWN` over the admin channel is the graceful path; ctrl-c is
    // the operator's emergency stop and simply ends the process, same as
    // a signal would on any single-process daemon with no supervisor to
    // hand off to.
    tokio::select! {
        _ = supervisor.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, exiting without a drain period");
        }
    }
    Ok(())
}
