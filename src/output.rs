// src/output.rs

//! Output pump.
//!
//! Backend output arrives on channel reader tasks, asynchronously relative to
//! call replies. Every piece of output goes through one pump task which
//! writes it to the console and records, per command, that its output has
//! been fully written. The command dispatcher waits on that record.

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::engine::CommandId;
use crate::transport::ChannelError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Text(String),
    /// Every piece of output produced by this command precedes this event.
    Flushed(CommandId),
}

/// Destination for backend output.
pub trait ConsoleOutput: Send + 'static {
    fn write(&mut self, text: &str);
}

/// Writes backend output to the process stdout.
#[derive(Debug, Default)]
pub struct StdoutOutput;

impl ConsoleOutput for StdoutOutput {
    fn write(&mut self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }
}

/// Sending side of the pump; cloned into every backend channel.
#[derive(Debug, Clone)]
pub struct OutputSink {
    tx: mpsc::UnboundedSender<OutputEvent>,
}

impl OutputSink {
    pub fn text(&self, text: impl Into<String>) {
        let _ = self.tx.send(OutputEvent::Text(text.into()));
    }

    pub fn flushed(&self, command: CommandId) {
        let _ = self.tx.send(OutputEvent::Flushed(command));
    }
}

/// Abandoned commands remembered at most; the oldest are forgotten first.
const MAX_ABANDONED: usize = 1024;

#[derive(Debug, Default)]
struct FlushLog {
    /// Commands whose flush marker was written and nobody has waited on yet.
    flushed: BTreeSet<CommandId>,
    /// Commands nobody waits for any more; their markers are dropped.
    abandoned: BTreeSet<CommandId>,
    pump_stopped: bool,
}

impl FlushLog {
    fn record(&mut self, command: CommandId) -> bool {
        if self.abandoned.remove(&command) {
            return false;
        }
        self.flushed.insert(command)
    }

    fn abandon(&mut self, command: CommandId) {
        if self.flushed.remove(&command) {
            return;
        }
        self.abandoned.insert(command);
        if self.abandoned.len() > MAX_ABANDONED {
            self.abandoned.pop_first();
        }
    }
}

/// Lets a caller wait until a command's output has been written.
#[derive(Debug, Clone)]
pub struct OutputBarrier {
    log: Arc<watch::Sender<FlushLog>>,
}

impl OutputBarrier {
    /// Start tracking the flush marker of `command`.
    ///
    /// If the returned [`PendingFlush`] is dropped before its marker was
    /// waited on, the marker is discarded whenever it arrives.
    pub fn expect(&self, command: CommandId) -> PendingFlush {
        PendingFlush {
            log: Arc::clone(&self.log),
            command,
            settled: false,
        }
    }

    /// Resolves once the flush marker for `command` has been written.
    /// Fails if the pump stopped first.
    pub async fn wait(&self, command: CommandId) -> Result<(), ChannelError> {
        self.expect(command).wait().await
    }

    /// Whether the flush marker for `command` has been written and not yet
    /// consumed by a waiter.
    pub fn is_flushed(&self, command: CommandId) -> bool {
        self.log.borrow().flushed.contains(&command)
    }
}

/// One command's flush marker, as tracked by [`OutputBarrier::expect`].
#[derive(Debug)]
pub struct PendingFlush {
    log: Arc<watch::Sender<FlushLog>>,
    command: CommandId,
    settled: bool,
}

impl PendingFlush {
    pub async fn wait(&mut self) -> Result<(), ChannelError> {
        let command = self.command;
        let mut log = self.log.subscribe();
        let seen = log
            .wait_for(|log| log.flushed.contains(&command) || log.pump_stopped)
            .await
            .is_ok_and(|log| log.flushed.contains(&command));
        if !seen {
            return Err(ChannelError::Disconnected);
        }
        self.log.send_if_modified(|log| {
            log.flushed.remove(&command);
            false
        });
        self.settled = true;
        Ok(())
    }
}

impl Drop for PendingFlush {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let command = self.command;
        self.log.send_if_modified(|log| {
            log.abandon(command);
            false
        });
    }
}

/// Spawn the pump task writing into `output`.
///
/// The task runs until every [`OutputSink`] clone has been dropped.
pub fn spawn_output_pump<W: ConsoleOutput>(mut output: W) -> (OutputSink, OutputBarrier) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputEvent>();
    let log = Arc::new(watch::Sender::new(FlushLog::default()));
    let pump_log = Arc::clone(&log);

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                OutputEvent::Text(text) => output.write(&text),
                OutputEvent::Flushed(command) => {
                    pump_log.send_if_modified(|log| log.record(command));
                }
            }
        }
        pump_log.send_modify(|log| log.pump_stopped = true);
        debug!("output pump finished (all sinks dropped)");
    });

    (OutputSink { tx }, OutputBarrier { log })
}
