// src/lib.rs

pub mod backend;
pub mod cli;
pub mod config;
pub mod console;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod output;
pub mod server;
pub mod supervisor;
pub mod transport;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tracing::{debug, info};

use crate::backend::ProcessBackendFactory;
use crate::cli::{CliArgs, CliCommand};
use crate::config::loader::load_or_default;
use crate::config::model::ConfigFile;
use crate::dispatch::CommandDispatcher;
use crate::output::{spawn_output_pump, StdoutOutput};
use crate::supervisor::RestartSupervisor;

/// High-level entry point used by `main.rs`. Returns the process exit code.
///
/// Without a subcommand this wires together:
/// - config loading (with CLI overrides)
/// - output pump
/// - process backend factory
/// - command dispatcher
/// - restart supervisor
/// - console and Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<i32> {
    if let Some(CliCommand::ServeBackend { bind }) = &args.command {
        return server::serve(bind).await;
    }

    let config_path = PathBuf::from(&args.config);
    let cfg = load_or_default(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let current_exe = std::env::current_exe().context("locating the replvisor executable")?;
    let mut process_options = cfg.process_options(current_exe);
    if let Some(program) = &args.backend {
        process_options.program = PathBuf::from(program);
    }

    let mut supervisor_options = cfg.supervisor_options();
    if args.exit_on_normal_exit {
        supervisor_options.exit_on_normal_exit = true;
    }
    if let Some(ms) = args.startup_timeout_ms {
        anyhow::ensure!(ms > 0, "--startup-timeout-ms must be >= 1");
        supervisor_options.startup_timeout = Duration::from_millis(ms);
    }

    describe(&cfg, &process_options.program);

    let (sink, barrier) = spawn_output_pump(StdoutOutput);
    let factory = Arc::new(ProcessBackendFactory::new(process_options, sink));
    let dispatcher = Arc::new(CommandDispatcher::new(barrier));
    let supervisor = Arc::new(RestartSupervisor::new(factory, dispatcher, supervisor_options));
    supervisor.start()?;

    console::spawn_interrupt_handler(Arc::clone(&supervisor));

    let stdin = BufReader::new(tokio::io::stdin());
    console::run_console(Arc::clone(&supervisor), stdin, StdoutOutput).await?;

    info!(state = ?supervisor.state(), "replvisor finished");
    Ok(0)
}

fn describe(cfg: &ConfigFile, program: &std::path::Path) {
    debug!(
        restart = ?cfg.supervisor.restart,
        startup_timeout_ms = cfg.supervisor.startup_timeout_ms,
        restart_delay_ms = cfg.supervisor.restart_delay_ms,
        terminate_grace_ms = cfg.supervisor.terminate_grace_ms,
        program = %program.display(),
        args = ?cfg.backend.args,
        "effective configuration"
    );
}
