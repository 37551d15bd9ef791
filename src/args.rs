use std::path::PathBuf;

use clap::{ArgAction, Args};

#[derive(Debug, Clone, Args)]
pub struct BaseArgs {
    /// Output as JSON
    #[arg(short = 'j', long, global = true)]
    pub json: bool,

    /// Account to sync as (or via STITCH_ACCOUNT)
    #[arg(long, env = "STITCH_ACCOUNT", global = true)]
    pub account: Option<String>,

    /// Remote storage location: https URL, file:// URL or path (or via STITCH_REMOTE_URL)
    #[arg(
        long,
        env = "STITCH_REMOTE_URL",
        hide_env_values = true,
        global = true
    )]
    pub remote_url: Option<String>,

    /// Bearer token for the remote store (or via STITCH_TOKEN)
    #[arg(long, env = "STITCH_TOKEN", hide_env_values = true, global = true)]
    pub token: Option<String>,

    /// Directory holding local patterns and progress (or via STITCH_DATA_DIR)
    #[arg(long, env = "STITCH_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to a .env file to load before running commands.
    #[arg(long, env = "STITCH_ENV_FILE", hide_env_values = true)]
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct CLIArgs<T: Args> {
    #[command(flatten)]
    pub base: BaseArgs,

    #[command(flatten)]
    pub args: T,
}
