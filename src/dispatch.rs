// src/dispatch.rs

//! Command dispatcher.
//!
//! Executes one command in a backend and returns only after every piece of
//! output the command produced has been written by the output pump. Output
//! travels separately from the call reply, so the reply alone says nothing
//! about whether the output has been displayed yet.

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::BackendHost;
use crate::engine::{CallError, CommandId, CompiledCommand, PendingCommand, RemoteError, ScopeHandle};
use crate::output::OutputBarrier;
use crate::transport::ChannelError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The command ran and raised an error. The backend is still alive.
    #[error("{0}")]
    Remote(RemoteError),

    /// The backend could not be reached (not running, died, channel broke).
    #[error("backend unreachable: {0}")]
    Unreachable(ChannelError),
}

impl From<CallError> for DispatchError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Remote(err) => DispatchError::Remote(err),
            CallError::Channel(err) => DispatchError::Unreachable(err),
        }
    }
}

#[derive(Debug)]
pub struct CommandDispatcher {
    barrier: OutputBarrier,
    next_command: AtomicU64,
}

impl CommandDispatcher {
    pub fn new(barrier: OutputBarrier) -> Self {
        Self {
            barrier,
            next_command: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> CommandId {
        CommandId(self.next_command.fetch_add(1, Ordering::Relaxed))
    }

    /// Execute `command` in `scope` (the backend's default scope if `None`).
    pub async fn execute(
        &self,
        host: &dyn BackendHost,
        command: CompiledCommand,
        scope: Option<ScopeHandle>,
    ) -> Result<Option<String>, DispatchError> {
        let pending = PendingCommand {
            id: self.next_id(),
            command,
            scope: scope.unwrap_or_else(|| host.default_scope()),
        };
        let id = pending.id;
        debug!(instance = %host.id(), command = %id, "dispatching command");
        // Dropped without waiting (early return, cancelled caller), the late
        // marker is discarded by the pump.
        let mut flush = self.barrier.expect(id);

        let engine = host.engine();
        let outcome = match engine.execute(pending).await {
            Err(CallError::Channel(err)) => return Err(DispatchError::Unreachable(err)),
            other => other,
        };

        // Output produced before a remote error is still owed to the caller,
        // so both success and remote errors wait for the flush marker.
        tokio::select! {
            biased;
            flushed = flush.wait() => {
                if let Err(err) = flushed {
                    return Err(DispatchError::Unreachable(err));
                }
            }
            err = host.closed() => {
                warn!(
                    instance = %host.id(),
                    command = %id,
                    error = %err,
                    "backend went away before command output was flushed"
                );
            }
        }

        outcome.map_err(DispatchError::from)
    }

    /// Ask the backend for a fresh scope.
    pub async fn create_scope(&self, host: &dyn BackendHost) -> Result<ScopeHandle, DispatchError> {
        host.engine().create_scope().await.map_err(DispatchError::from)
    }
}
