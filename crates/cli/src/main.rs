//! crossrun CLI - Main Entry Point
//!
//! Runs a URL on cloud browsers, lists tunnel processes, and manages the
//! cached tunnel binaries.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod output;

use commands::{binary, run, tunnels};

/// crossrun - one browser test, several cloud vendors
#[derive(Parser)]
#[command(name = "crossrun")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(long, global = true, env = "CROSSRUN_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a URL on one or more browsers and wait for the jobs to finish
    Run(run::RunArgs),

    /// List tunnel processes running on this machine
    Tunnels(tunnels::TunnelsArgs),

    /// Manage cached tunnel binaries
    #[command(subcommand)]
    Binary(binary::BinaryCommands),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Run(args) => run::execute(args, config, cli.format).await?,
        Commands::Tunnels(args) => tunnels::execute(args, config, cli.format).await?,
        Commands::Binary(cmd) => binary::execute(cmd, config, cli.format).await?,
        Commands::Version => {
            println!("crossrun v{}", crossrun_common::VERSION);
            println!("Vendors: browserstack, saucelabs, crossbrowsertesting");
        }
    }

    Ok(())
}
