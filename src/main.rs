use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use staging_integrator::app::{self, AppExit, RESTART_EXIT_CODE};
use staging_integrator::config::Config;

/// Gerrit/Jenkins staging-branch integration daemon.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(
        short,
        long,
        env = "STAGING_INTEGRATOR_CONFIG",
        default_value = "/etc/staging-integrator.toml"
    )]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if args.check {
        println!(
            "{} ok: {} project(s) configured",
            args.config.display(),
            config.projects.len()
        );
        return ExitCode::SUCCESS;
    }

    match app::run(config).await {
        Ok(AppExit::Shutdown) => ExitCode::SUCCESS,
        Ok(AppExit::Restart) => ExitCode::from(RESTART_EXIT_CODE),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
