//! Command-line interface definitions using clap.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// Per-identity worker-process supervisor daemon.
#[derive(Parser, Debug)]
#[command(name = "broodd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the server configuration file.
    #[arg(short, long, env = "BROOD_CONFIG", default_value = "brood.toml")]
    pub config: PathBuf,

    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format: pretty, compact, json.
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log to this file in addition to stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the supervisor and its worker fleet.
    Serve,

    /// Validate the configuration file and exit.
    Check,

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "broodd",
            &mut std::io::stdout(),
        );
    }
}
