//! appfence: per-application internet blocking.
//!
//! Entry point for the `appfence` binary. Parses the command line, installs
//! logging and the audit logger, loads configuration and hands off to the
//! subcommand handler.
//!
//! Diagnostic logs go to stderr; audit events go to syslog.

use anyhow::{Context, Result};
use appfence::{cli::Cli, cli_handler, config::ConfigLoader, telemetry};
use clap::Parser;
use tracing::{debug, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose)?;
    debug!("Parsed CLI arguments: {:?}", cli);

    // Without syslog, audit events only reach the debug log.
    if let Err(e) = telemetry::init_logger() {
        warn!("Audit logging unavailable: {}", e);
    }

    let config = ConfigLoader::new()
        .load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    debug!("Loaded configuration: {:?}", config);

    cli_handler::handle_command(cli, config).await
}

/// Initialize the tracing subscriber for diagnostic logging.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG`, or warnings and errors
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
