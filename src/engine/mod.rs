// src/engine/mod.rs

//! Execution-engine interface.
//!
//! The supervisor treats the script engine living in a backend process as an
//! opaque object reached through [`ExecutionEngine`]. Every call has three
//! distinguishable outcomes:
//! - success,
//! - [`CallError::Remote`]: the remote code raised an error (the backend is fine),
//! - [`CallError::Channel`]: the channel failed (the backend may be gone).
//!
//! - [`remote`] implements the trait as a proxy over an `RpcClient`.
//! - [`line`] is the small interpreter hosted by `replvisor serve-backend`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::ChannelError;
use crate::types::BoxFuture;

pub mod line;
pub mod remote;

pub use line::{Action, LineEngine};
pub use remote::RemoteEngine;

/// Identifies one submitted command; output flush markers carry it back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to a scope living inside one backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeHandle(pub u64);

/// A command ready to be executed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledCommand {
    source: String,
}

impl CompiledCommand {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// One execute round trip: a command bound to its target scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub id: CommandId,
    pub command: CompiledCommand,
    pub scope: ScopeHandle,
}

/// Error raised by remote code.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new("RuntimeError", message)
    }

    pub fn name_error(name: &str) -> Self {
        Self::new("NameError", format!("name '{name}' is not defined"))
    }

    pub fn interrupted() -> Self {
        Self::new("Interrupted", "command was interrupted")
    }

    pub fn is_interrupt(&self) -> bool {
        self.kind == "Interrupted"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("{0}")]
    Remote(#[from] RemoteError),
}

pub type CallResult<T> = Result<T, CallError>;

/// The remote script engine, as seen from the supervisor process.
pub trait ExecutionEngine: Send + Sync {
    /// Execute a command. `Ok(None)` means the command produced no value.
    fn execute(&self, command: PendingCommand) -> BoxFuture<'_, CallResult<Option<String>>>;

    /// Evaluate `expression` and list the resulting object's member names.
    fn member_names(&self, expression: &str) -> BoxFuture<'_, CallResult<Vec<String>>>;

    fn create_scope(&self) -> BoxFuture<'_, CallResult<ScopeHandle>>;
}
