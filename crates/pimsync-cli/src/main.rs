//! pimsync CLI - Inspect the change journal of a storage agent
//!
//! Reads the journal next to an agent's settings file. Only `compact` writes,
//! and it does so through the recorder's own save path.

mod cli;
mod commands;
mod error;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::commands::compact::run_compact;
use crate::commands::dump::run_dump;
use crate::commands::info::run_info;
use crate::error::CliError;

fn main() {
    if let Err(error) = run() {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = "pimsync=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Dump { json } => run_dump(&cli.config, json)?,
        Commands::Info { json } => run_info(&cli.config, json)?,
        Commands::Compact => run_compact(&cli.config)?,
    }

    Ok(())
}
