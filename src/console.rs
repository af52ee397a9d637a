// src/console.rs

//! Minimal foreground console.
//!
//! Reads lines and maps them onto supervisor operations:
//!
//! ```text
//! :restart        restart the backend
//! :members EXPR   list member names of EXPR (empty EXPR: the variables)
//! :quit           terminate and leave (EOF does the same)
//! anything else   execute in the current backend
//! ```
//!
//! Ctrl-C interrupts the running command instead of ending the process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::dispatch::DispatchError;
use crate::engine::CompiledCommand;
use crate::output::ConsoleOutput;
use crate::supervisor::{RestartSupervisor, SupervisorState};

/// How long an unreachable command waits for a replacement backend before
/// the console reads the next line anyway.
const REPLACEMENT_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Empty,
    Quit,
    Restart,
    Members(String),
    Execute(String),
}

pub fn parse_line(line: &str) -> ConsoleCommand {
    let line = line.trim();
    if line.is_empty() {
        return ConsoleCommand::Empty;
    }

    let Some(directive) = line.strip_prefix(':') else {
        return ConsoleCommand::Execute(line.to_string());
    };

    let (name, rest) = match directive.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (directive, ""),
    };

    match name {
        "quit" | "q" | "exit" => ConsoleCommand::Quit,
        "restart" => ConsoleCommand::Restart,
        "members" => ConsoleCommand::Members(rest.to_string()),
        _ => ConsoleCommand::Execute(line.to_string()),
    }
}

/// Route Ctrl-C to [`RestartSupervisor::break_execution`] for as long as the
/// process runs.
pub fn spawn_interrupt_handler(supervisor: Arc<RestartSupervisor>) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            debug!("Ctrl+C: interrupting the running command");
            supervisor.break_execution();
        }
    });
}

/// Run the console until `:quit`, end of input, or the supervisor stopping
/// by itself. Always leaves the supervisor terminated.
pub async fn run_console<R, W>(supervisor: Arc<RestartSupervisor>, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: ConsoleOutput,
{
    let mut lines = input.lines();

    loop {
        let next = tokio::select! {
            biased;
            _ = stopped(supervisor.subscribe()) => {
                info!("supervisor stopped; leaving console");
                break;
            }
            next = lines.next_line() => next?,
        };

        let Some(line) = next else {
            debug!("end of console input");
            break;
        };

        match parse_line(&line) {
            ConsoleCommand::Empty => {}
            ConsoleCommand::Quit => break,
            ConsoleCommand::Restart => {
                output.write("restarting backend\n");
                supervisor.restart_console();
            }
            ConsoleCommand::Members(expression) => {
                for name in supervisor.get_member_names(&expression).await {
                    output.write(&format!("{name}\n"));
                }
            }
            ConsoleCommand::Execute(source) => {
                execute(&supervisor, &mut output, source).await;
            }
        }
    }

    supervisor.terminate().await;
    Ok(())
}

async fn execute<W: ConsoleOutput>(supervisor: &RestartSupervisor, output: &mut W, source: String) {
    match supervisor.execute(CompiledCommand::new(source), None).await {
        Ok(Some(value)) => output.write(&format!("{value}\n")),
        Ok(None) => {}
        Err(DispatchError::Remote(err)) => output.write(&format!("error: {err}\n")),
        Err(DispatchError::Unreachable(err)) => {
            output.write(&format!("backend unavailable ({err}); waiting for a new one\n"));
            if supervisor.wait_for_instance(REPLACEMENT_WAIT).await.is_none() {
                debug!("no backend became current while waiting");
            }
        }
    }
}

async fn stopped(mut state: watch::Receiver<SupervisorState>) {
    let _ = state.wait_for(SupervisorState::is_stopped).await.is_ok();
}
