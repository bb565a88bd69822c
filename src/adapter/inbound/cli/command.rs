//! Command-line interface definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Stop-loss, take-profit and margin-call execution engine
#[derive(Parser, Debug)]
#[command(name = "tripwire")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the engine against the simulated market until Ctrl-C
    Run(RunArgs),

    /// Validate a configuration file and print the effective settings
    Check(CheckArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the configuration file
    #[arg(short, long, default_value = "tripwire.toml")]
    pub config: PathBuf,

    /// Override the log level from the configuration file
    #[arg(long)]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Path to the configuration file
    #[arg(short, long, default_value = "tripwire.toml")]
    pub config: PathBuf,

    /// Print the effective configuration as JSON
    #[arg(long)]
    pub json: bool,
}
