use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cli;

use cli::{run_command, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level(&cli)))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    if let Err(e) = run_command(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Default filter from the config file and environment
fn default_level(cli: &Cli) -> String {
    let config = match &cli.config {
        Some(path) => flowscribe::Config::from_file(path).unwrap_or_default(),
        None => {
            let mut config = flowscribe::Config::default();
            config.apply_env_overrides();
            config
        }
    };
    config.logging.level
}
