use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// imageprep - post-imaging workstation setup
#[derive(Parser)]
#[command(name = "imageprep")]
#[command(about = "Bring a freshly imaged workstation to its compliance baseline")]
#[command(version)]
pub struct Cli {
    /// Override the local cache root (state document and relocated copy)
    #[arg(long, global = true)]
    pub cache_root: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the setup pipeline, resuming an interrupted run if one is pending
    Run {
        /// Path to configuration file (defaults to /etc/imageprep/config.json if present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Comma-separated tasks to run, e.g. policy_refresh,driver_update
        #[arg(short, long)]
        tasks: Option<String>,

        /// Log every external command instead of running it; each counts as exit 0
        #[arg(long)]
        dry_run: bool,

        /// Never copy to the local cache and relaunch
        #[arg(long)]
        no_relaunch: bool,
    },
    /// Show the persisted run state and whether it would be resumed
    Status {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Discard the persisted run state
    Abandon {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        config: PathBuf,
    },
    /// Print the current machine inventory
    Inventory {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
