// src/supervisor/control.rs

use tokio::sync::oneshot;

use crate::dispatch::DispatchError;
use crate::engine::{CompiledCommand, ScopeHandle};

/// Requests from foreground handles to the supervisor loop.
///
/// Only the loop touches the current backend; everything the foreground
/// wants done to it travels as one of these.
#[derive(Debug)]
pub enum ControlRequest {
    BreakExecution,
    RestartConsole,
    MemberNames {
        expression: String,
        reply: oneshot::Sender<Vec<String>>,
    },
    Execute {
        command: CompiledCommand,
        scope: Option<ScopeHandle>,
        reply: oneshot::Sender<Result<Option<String>, DispatchError>>,
    },
    CreateScope {
        reply: oneshot::Sender<Result<ScopeHandle, DispatchError>>,
    },
    Terminate,
}
