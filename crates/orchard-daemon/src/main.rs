//! Orchard daemon entry point.
//!
//! Exit codes: 0 normal shutdown, 2 configuration error, 3 mount error,
//! 4 authentication error.

mod supervisor;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use orchard_core::config::Config;

/// User-space synchronization daemon projecting iCloud Drive as a local
/// filesystem.
#[derive(Debug, Parser)]
#[command(name = "orchardd", version, about)]
struct Args {
    /// Path to the configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Remote driver to run against. `memory` is the in-process
    /// development driver; the production iCloud client registers itself
    /// under its own name.
    #[arg(long, default_value = "memory")]
    driver: String,

    /// Override the tracing filter (`RUST_LOG` syntax).
    #[arg(long)]
    log: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let config = match Config::load_or_default(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("orchardd: cannot read {}: {e}", config_path.display());
            return ExitCode::from(supervisor::EXIT_CONFIG);
        }
    };

    let filter = args
        .log
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| config.log_filter.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let errors = config.validate();
    if !errors.is_empty() {
        for error in &errors {
            eprintln!("orchardd: config: {error}");
        }
        return ExitCode::from(supervisor::EXIT_CONFIG);
    }

    match supervisor::run(config, &args.driver) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e.source, "Daemon exited with error");
            eprintln!("orchardd: {}", e.source);
            ExitCode::from(e.code)
        }
    }
}
