mod commands;
mod config;
mod fetch;
mod http;
mod manager;
mod server;
mod store;

use clap::{ArgAction, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use commands::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "silo")]
#[command(about = "Offline-first caching proxy for small static web apps")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/silo/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Increase log verbosity (-v debug, -vv trace)
  #[arg(short, long, global = true, action = ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the manifest, sweep stale buckets, and serve
  Serve,
  /// Run the precache pass and exit
  Precache,
  /// Show cache buckets and entry counts
  Status {
    #[arg(long, value_enum, default_value = "table")]
    format: OutputFormat,
  },
  /// Delete stale cache buckets
  Clear {
    /// Also delete the current version's bucket
    #[arg(long)]
    all: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  let _guard = init_tracing(args.verbose, config.log_file.as_deref())?;

  match args.command {
    Command::Serve => commands::serve(config).await,
    Command::Precache => commands::precache(config).await,
    Command::Status { format } => commands::status(config, format),
    Command::Clear { all } => commands::clear(config, all),
  }
}

/// Set up tracing output. RUST_LOG overrides the verbosity flags; the
/// returned guard must live for the process when logging to a file.
fn init_tracing(
  verbosity: u8,
  log_file: Option<&Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
  let default_filter = match verbosity {
    0 => "silo=info",
    1 => "silo=debug",
    _ => "silo=trace,tower_http=debug",
  };
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

  if let Some(path) = log_file {
    let file = std::fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(path)
      .map_err(|e| eyre!("Failed to open log file {}: {}", path.display(), e))?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(writer)
      .with_ansi(false)
      .init();
    Ok(Some(guard))
  } else {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    Ok(None)
  }
}
