use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nfsrods", version, about = "Inspect an nfsrods configuration and browse through the adapter")]
pub struct Cli {
    /// Path to server.json (defaults to $NFSRODS_CONFIG_HOME/server.json)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args)]
pub struct Target {
    /// Host directory standing in for the zone
    #[arg(short, long)]
    pub backend: PathBuf,

    /// Numeric uid issuing the requests
    #[arg(short, long)]
    pub uid: u32,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load and validate the configuration
    Check,
    /// List a directory below the mount point
    Ls {
        #[command(flatten)]
        target: Target,
        #[arg(default_value = "")]
        path: String,
    },
    /// Print translated attributes
    Stat {
        #[command(flatten)]
        target: Target,
        path: String,
    },
    /// Write a data object to stdout
    Cat {
        #[command(flatten)]
        target: Target,
        path: String,
    },
}
