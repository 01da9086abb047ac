//! CLI argument parsing for pstream

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "pstream")]
#[command(
    author,
    version,
    about = "Batch panel requests over one transport and route the streamed answers",
    long_about = None
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate the panel configuration and print the activation order
    Check,

    /// Run one page session against the configured endpoint
    Run {
        /// Override the streaming root endpoint
        #[arg(long)]
        root_url: Option<String>,

        /// JSON tag sent with every batch
        #[arg(long)]
        tag: Option<String>,
    },
}
