use anyhow::Result;
use clap::{Parser, Subcommand};
use std::ffi::OsString;

mod args;
mod auth;
mod autosave;
mod codec;
mod config;
mod context;
mod env;
mod error;
mod logging;
mod model;
mod pattern;
mod progress;
mod reconcile;
mod rolling;
mod snapshot;
mod storage;
mod sync;
#[cfg(test)]
mod testutil;
mod ui;
mod utils;
mod watch;

use crate::args::CLIArgs;

const DEFAULT_DEV_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-dev");
const CLI_VERSION: &str = match option_env!("STITCH_VERSION_STRING") {
    Some(version) => version,
    None => DEFAULT_DEV_VERSION,
};

#[derive(Debug, Parser)]
#[command(
    name = "stitch",
    about = "Cross-stitch progress autosave and sync",
    version = CLI_VERSION
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import, list and forget local patterns
    Pattern(CLIArgs<pattern::PatternArgs>),
    /// Inspect and edit stitching progress
    Progress(CLIArgs<progress::ProgressArgs>),
    /// Manage the remote snapshot ring of a pattern
    Snapshot(CLIArgs<snapshot::SnapshotArgs>),
    /// Reconcile local patterns and progress with the remote account
    Sync(CLIArgs<sync::SyncArgs>),
    /// Autosave a pattern's progress while it is being edited
    Watch(CLIArgs<watch::WatchArgs>),
    /// View and modify configuration
    Config(CLIArgs<config::ConfigArgs>),
}

impl Commands {
    fn verbose(&self) -> u8 {
        match self {
            Commands::Pattern(cmd) => cmd.base.verbose,
            Commands::Progress(cmd) => cmd.base.verbose,
            Commands::Snapshot(cmd) => cmd.base.verbose,
            Commands::Sync(cmd) => cmd.base.verbose,
            Commands::Watch(cmd) => cmd.base.verbose,
            Commands::Config(cmd) => cmd.base.verbose,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let argv: Vec<OsString> = std::env::args_os().collect();
    env::bootstrap_from_args(&argv)?;
    let cli = Cli::parse_from(argv);
    logging::init(
        cli.command.verbose(),
        matches!(cli.command, Commands::Watch(_)),
    );

    match cli.command {
        Commands::Pattern(cmd) => pattern::run(cmd.base, cmd.args).await?,
        Commands::Progress(cmd) => progress::run(cmd.base, cmd.args).await?,
        Commands::Snapshot(cmd) => snapshot::run(cmd.base, cmd.args).await?,
        Commands::Sync(cmd) => sync::run(cmd.base, cmd.args).await?,
        Commands::Watch(cmd) => watch::run(cmd.base, cmd.args).await?,
        Commands::Config(cmd) => config::run(cmd.base, cmd.args)?,
    }

    Ok(())
}
