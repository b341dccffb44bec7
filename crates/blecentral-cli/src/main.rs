use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;
mod config;
mod format;

use cli::{Cli, Commands};
use commands::{ConnectArgs, cmd_config, cmd_connect, cmd_scan};
use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    // When quiet mode is enabled, suppress info-level logging
    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load();

    match cli.command {
        Commands::Scan {
            timeout,
            format,
            dedup,
        } => cmd_scan(timeout, format, dedup.map(Into::into), cli.quiet, &config).await,
        Commands::Connect {
            address,
            listen,
            reads,
            writes,
            text,
            timeout,
            scan,
            format,
        } => {
            let args = ConnectArgs {
                address,
                listen,
                reads,
                writes,
                text,
                timeout,
                scan,
                format,
            };
            cmd_connect(args, cli.quiet, &config).await
        }
        Commands::Config { action } => cmd_config(action, &config),
    }
}
