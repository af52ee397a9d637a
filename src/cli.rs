// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `replvisor`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "replvisor",
    version,
    about = "Interactive console that keeps its evaluation backend alive across crashes and restarts.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML). A missing file means defaults.
    #[arg(long, value_name = "PATH", default_value = "Replvisor.toml")]
    pub config: String,

    /// Stop the supervisor when a backend exits with status 0 instead of
    /// starting a replacement.
    #[arg(long)]
    pub exit_on_normal_exit: bool,

    /// Program to spawn as the backend (overrides `[backend].program`).
    #[arg(long, value_name = "PROGRAM")]
    pub backend: Option<String>,

    /// Bound on backend startup in milliseconds (overrides
    /// `[supervisor].startup_timeout_ms`).
    #[arg(long, value_name = "MS")]
    pub startup_timeout_ms: Option<u64>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `REPLVISOR_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum CliCommand {
    /// Run as a backend: serve one supervisor connection.
    #[command(hide = true)]
    ServeBackend {
        /// Address to listen on; port 0 picks a free port.
        #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:0")]
        bind: String,
    },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = CliArgs::try_parse_from(["replvisor"]).unwrap();
        assert_eq!(args.config, "Replvisor.toml");
        assert!(!args.exit_on_normal_exit);
        assert!(args.command.is_none());
    }

    #[test]
    fn serve_backend_subcommand() {
        let args = CliArgs::try_parse_from(["replvisor", "serve-backend", "--bind", "127.0.0.1:4000"]).unwrap();
        match args.command {
            Some(CliCommand::ServeBackend { bind }) => assert_eq!(bind, "127.0.0.1:4000"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn overrides() {
        let args = CliArgs::try_parse_from([
            "replvisor",
            "--exit-on-normal-exit",
            "--backend",
            "/opt/backend",
            "--startup-timeout-ms",
            "500",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert!(args.exit_on_normal_exit);
        assert_eq!(args.backend.as_deref(), Some("/opt/backend"));
        assert_eq!(args.startup_timeout_ms, Some(500));
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
    }
}
