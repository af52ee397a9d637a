// src/backend/mod.rs

//! Backend host handles.
//!
//! A [`BackendHost`] is one lifecycle of a backend process: spawned by a
//! [`BackendFactory`], run to completion by the supervisor loop, then
//! disposed. The supervisor only ever talks to backends through these two
//! traits, which lets tests swap in fakes that never spawn a process.
//!
//! [`process`] provides the production implementation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::engine::{ExecutionEngine, ScopeHandle};
use crate::transport::ChannelError;
use crate::types::BoxFuture;

pub mod process;

pub use process::{ProcessBackend, ProcessBackendFactory, ProcessOptions, HANDSHAKE_PREFIX};

/// Identity of one backend lifecycle. Never reused within a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The backend could not be brought up. The supervisor abandons the attempt
/// and tries again; this never reaches the foreground.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to spawn backend: {0}")]
    Spawn(String),

    #[error("backend handshake failed: {0}")]
    Handshake(String),

    #[error("backend channel failed during startup: {0}")]
    Channel(#[from] ChannelError),

    #[error("backend did not become ready within {0:?}")]
    TimedOut(Duration),
}

/// One running backend process.
pub trait BackendHost: Send + Sync {
    fn id(&self) -> InstanceId;

    /// Proxy for the backend's execution engine.
    fn engine(&self) -> Arc<dyn ExecutionEngine>;

    fn default_scope(&self) -> ScopeHandle;

    fn is_alive(&self) -> bool;

    /// Resolves once the channel to the backend has failed or been closed.
    fn closed(&self) -> BoxFuture<'_, ChannelError>;

    /// Run the backend session until it exits or its channel fails, and
    /// return its exit code. Long-running; only the supervisor loop calls it.
    fn run(&self, args: Vec<String>) -> BoxFuture<'_, i32>;

    /// Ask the backend to interrupt the command it is executing. A no-op when
    /// nothing is executing.
    fn abort_command(&self) -> BoxFuture<'_, Result<(), ChannelError>>;

    /// Request shutdown. `run` returns once the backend is gone. Non-blocking.
    fn terminate(&self, exit_code: i32);

    /// Release the channel and process. Idempotent.
    fn dispose(&self);
}

/// Creates backend hosts. Must hand back a fully started host or an error,
/// never a half-initialized one.
pub trait BackendFactory: Send + Sync {
    fn create(&self, id: InstanceId) -> BoxFuture<'_, Result<Arc<dyn BackendHost>, StartupError>>;
}
