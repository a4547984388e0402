use std::ffi::OsString;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod args;
mod env;
mod pull;
mod status;
mod ui;
mod utils;
mod zones;

use crate::args::CLIArgs;

const DEFAULT_DEV_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-dev");
const CLI_VERSION: &str = match option_env!("BACKFILL_VERSION_STRING") {
    Some(version) => version,
    None => DEFAULT_DEV_VERSION,
};

#[derive(Debug, Parser)]
#[command(
    name = "backfill",
    about = "Sharded, resumable history backfill",
    version = CLI_VERSION
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch a conversation's full history into local JSONL parts
    Pull(CLIArgs<pull::PullArgs>),
    /// Show the state of a conversation's last run
    Status(CLIArgs<status::StatusArgs>),
    /// List or clear learned hot zones
    Zones(CLIArgs<zones::ZonesArgs>),
}

impl Commands {
    fn verbosity(&self) -> u8 {
        match self {
            Commands::Pull(cmd) => cmd.base.verbose,
            Commands::Status(cmd) => cmd.base.verbose,
            Commands::Zones(cmd) => cmd.base.verbose,
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("backfill={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

// Workers overlap network waits on one thread; no CPU parallelism is needed.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let argv: Vec<OsString> = std::env::args_os().collect();
    env::bootstrap_from_args(&argv)?;
    let cli = Cli::parse_from(argv);
    init_tracing(cli.command.verbosity());

    match cli.command {
        Commands::Pull(cmd) => pull::run(cmd.base, cmd.args).await?,
        Commands::Status(cmd) => status::run(cmd.base, cmd.args).await?,
        Commands::Zones(cmd) => zones::run(cmd.base, cmd.args).await?,
    }

    Ok(())
}
