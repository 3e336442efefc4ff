//! chanrpc CLI: drive channel sessions between a simulated page and frame.
//!
//! Both contexts live in this process and exchange payloads over the
//! loopback transport, so every protocol path (handshake, calls, callbacks,
//! notifications, errors, timeouts) can be exercised from a terminal.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::ffi::OsString;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod commands;
pub mod config;
pub mod session;

pub use config::CliConfig;
pub use session::Session;

/// chanrpc command-line harness
#[derive(Parser, Debug)]
#[command(name = "chanrpc")]
#[command(about = "Run RPC channel sessions between a simulated page and frame", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML file with [parent] and [child] channel options
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Put both channels in this scope
    #[arg(long)]
    scope: Option<String>,

    /// Log every message each channel posts and receives
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Handshake, a call with progress callbacks, a notification, a handler
    /// error and a timeout
    Demo,

    /// Echo TEXT through the frame
    Echo {
        text: String,

        /// Number of calls to make
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },

    /// Print the normalized form of an origin
    CheckOrigin { origin: String },
}

/// Run using the current process arguments.
///
/// Must be awaited inside a `tokio::task::LocalSet`.
pub async fn run() -> Result<()> {
    run_with_args(std::env::args_os()).await
}

/// Run using the provided argument iterator.
pub async fn run_with_args<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);

    let filter = if cli.verbose { "chanrpc=debug" } else { "chanrpc=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();

    let mut config = CliConfig::load(cli.config.as_deref())?.with_debug_output(cli.verbose);
    if let Some(scope) = cli.scope {
        config = config.with_scope(scope);
    }

    match cli.command {
        Commands::Demo => commands::demo(&config).await,
        Commands::Echo { text, count } => commands::echo(&config, &text, count).await,
        Commands::CheckOrigin { origin } => commands::check_origin(&origin),
    }
}
