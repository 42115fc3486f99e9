use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pimsync")]
#[command(about = "Inspect and maintain the change journal of a storage agent")]
#[command(version)]
pub struct Cli {
    /// Settings file of the agent; its journal sits next to it
    #[arg(long, value_name = "SETTINGS")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the pending notifications
    Dump {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print journal header facts and recovery statistics
    Info {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Import legacy changes and rewrite the journal in the current format
    ///
    /// Only run this while the agent owning the journal is stopped.
    Compact,
}
