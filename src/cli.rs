//! Command-line interface definitions for appfence.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Per-application internet blocking without a system-wide VPN.
///
/// appfence routes a blocked app's HTTP traffic through a private filtering
/// proxy and, where a superuser shell is available, adds per-UID packet
/// filter rules and an isolated virtual interface.
#[derive(Parser, Debug)]
#[command(name = "appfence")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// What to do.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to additional config file.
    ///
    /// Merged on top of the system and user configs.
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Log privileged commands instead of running them.
    #[arg(long = "dry-run", global = true)]
    pub dry_run: bool,

    /// How privileged commands are run.
    #[arg(long = "exec", value_enum, default_value_t = ExecMode::Su, global = true)]
    pub exec: ExecMode,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// How privileged commands reach the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecMode {
    /// Through `su -c`.
    Su,
    /// Directly, when appfence already runs as root.
    Direct,
    /// Never; app-level enforcement only.
    None,
}

/// Subcommands for appfence.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Block packages until interrupted, then restore them.
    Run {
        /// Package to block (repeatable).
        #[arg(short = 'b', long = "block", value_name = "PACKAGE", required = true)]
        block: Vec<String>,

        /// Leave Wi-Fi traffic alone.
        #[arg(long = "allow-wifi")]
        allow_wifi: bool,

        /// Leave cellular traffic alone.
        #[arg(long = "allow-cellular")]
        allow_cellular: bool,
    },

    /// Show privilege, network type and package UIDs.
    Status {
        /// Packages to resolve.
        packages: Vec<String>,
    },

    /// Remove leftovers from a crashed session.
    Cleanup,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::parse_from([
            "appfence",
            "run",
            "--block",
            "com.example.a",
            "-b",
            "com.example.b",
            "--allow-cellular",
        ]);
        match cli.command {
            Commands::Run {
                block,
                allow_wifi,
                allow_cellular,
            } => {
                assert_eq!(block, vec!["com.example.a", "com.example.b"]);
                assert!(!allow_wifi);
                assert!(allow_cellular);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(cli.exec, ExecMode::Su);
        assert!(!cli.dry_run);
    }

    #[test]
    fn test_run_requires_package() {
        assert!(Cli::try_parse_from(["appfence", "run"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "appfence",
            "status",
            "com.example.a",
            "--dry-run",
            "--exec",
            "direct",
            "-vv",
            "-c",
            "/tmp/extra.toml",
        ]);
        assert!(cli.dry_run);
        assert_eq!(cli.exec, ExecMode::Direct);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/extra.toml")));
        assert!(matches!(cli.command, Commands::Status { ref packages } if packages.len() == 1));
    }

    #[test]
    fn test_cleanup_command() {
        let cli = Cli::parse_from(["appfence", "cleanup"]);
        assert!(matches!(cli.command, Commands::Cleanup));
    }
}
