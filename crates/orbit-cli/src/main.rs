//! Orbit CLI - Command-line interface for Orbit extensions.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

/// Orbit extension host
#[derive(Parser)]
#[command(name = "orbit")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(short = 'f', long, global = true, default_value = "human")]
    pub format: OutputFormat,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (suppress non-essential output)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Output format options.
#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output
    #[default]
    Human,
    /// JSON output
    Json,
    /// Compact JSON (single line)
    JsonCompact,
}

impl OutputFormat {
    /// Serialize `value` in this format, if it is a JSON one.
    pub fn json<T: serde::Serialize>(self, value: &T) -> serde_json::Result<Option<String>> {
        match self {
            OutputFormat::Human => Ok(None),
            OutputFormat::Json => serde_json::to_string_pretty(value).map(Some),
            OutputFormat::JsonCompact => serde_json::to_string(value).map(Some),
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Load an extension and list its exports
    Inspect(commands::inspect::InspectArgs),
    /// Call one exported function against a scratch guest memory
    Call(commands::call::CallArgs),
    /// Keep an extension loaded and report reloads as the binary changes
    Watch(commands::watch::WatchArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("orbit={}", log_level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // Run the command
    let result = config::load(cli.config.as_deref()).and_then(|bridge| match cli.command {
        Commands::Inspect(args) => commands::inspect::execute(args, bridge, cli.format),
        Commands::Call(args) => commands::call::execute(args, bridge, cli.format, cli.quiet),
        Commands::Watch(args) => commands::watch::execute(args, bridge, cli.format, cli.quiet),
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if !cli.quiet {
                eprintln!("Error: {:#}", e);
            }
            ExitCode::FAILURE
        }
    }
}
