// src/supervisor/mod.rs

//! Restart supervisor.
//!
//! Keeps a backend alive behind an interactive console: it launches a
//! backend through a [`BackendFactory`], runs it until it exits, disposes it
//! and launches a replacement, until [`RestartSupervisor::terminate`] is
//! called (or, with `exit_on_normal_exit`, until a backend exits cleanly).
//! A crash and an explicit [`RestartSupervisor::restart_console`] go down
//! the same path.
//!
//! - [`state`] is the pure state machine (no Tokio, no IO).
//! - [`runner`] is the async loop around it.
//! - [`control`] defines the requests the handle sends to the loop.
//!
//! Every foreground operation returns promptly whether or not a backend is
//! currently alive, and none of them surfaces a channel failure.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::backend::{BackendFactory, InstanceId};
use crate::dispatch::{CommandDispatcher, DispatchError};
use crate::engine::{CompiledCommand, ScopeHandle};
use crate::transport::ChannelError;
use crate::types::lock;

pub mod control;
mod runner;
pub mod state;

pub use control::ControlRequest;
pub use state::{AfterExit, LoopCore, SupervisorPhase, SupervisorState};

use runner::SupervisorLoop;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisorError {
    #[error("supervisor was already started")]
    AlreadyStarted,

    #[error("supervisor has been terminated")]
    Terminated,

    #[error("supervisor must be started from within a Tokio runtime")]
    NoRuntime,
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Stop instead of restarting when a backend exits with status 0.
    pub exit_on_normal_exit: bool,
    /// Bound on creating a backend (spawn + handshake).
    pub startup_timeout: Duration,
    /// Pause after a failed startup before the next attempt.
    pub restart_delay: Duration,
    /// Arguments handed to each backend's `run`.
    pub run_args: Vec<String>,
    /// Bound on a member name lookup in the backend.
    pub member_lookup_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            exit_on_normal_exit: false,
            startup_timeout: Duration::from_secs(10),
            restart_delay: Duration::from_millis(250),
            run_args: Vec::new(),
            member_lookup_timeout: Duration::from_secs(2),
        }
    }
}

/// Foreground handle to the supervisor loop.
pub struct RestartSupervisor {
    control_tx: mpsc::UnboundedSender<ControlRequest>,
    state_tx: Arc<watch::Sender<SupervisorState>>,
    state_rx: watch::Receiver<SupervisorState>,
    pending: Mutex<Option<SupervisorLoop>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RestartSupervisor {
    pub fn new(
        factory: Arc<dyn BackendFactory>,
        dispatcher: Arc<CommandDispatcher>,
        options: SupervisorOptions,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SupervisorState::not_started());
        let state_tx = Arc::new(state_tx);
        let supervisor_loop = SupervisorLoop::new(
            factory,
            dispatcher,
            options,
            control_rx,
            Arc::clone(&state_tx),
        );

        Self {
            control_tx,
            state_tx,
            state_rx,
            pending: Mutex::new(Some(supervisor_loop)),
            handle: Mutex::new(None),
        }
    }

    /// Launch the supervisor loop on the current Tokio runtime.
    pub fn start(&self) -> Result<(), SupervisorError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SupervisorError::NoRuntime)?;

        let Some(supervisor_loop) = lock(&self.pending).take() else {
            return Err(if self.state_rx.borrow().is_terminating() {
                SupervisorError::Terminated
            } else {
                SupervisorError::AlreadyStarted
            });
        };

        let handle = runtime.spawn(supervisor_loop.run());
        *lock(&self.handle) = Some(handle);
        Ok(())
    }

    /// Interrupt the command running in the current backend, if any.
    /// Advisory: does not wait for the interruption to happen.
    pub fn break_execution(&self) {
        self.send(ControlRequest::BreakExecution);
    }

    /// Replace the current backend with a fresh one, if there is one.
    pub fn restart_console(&self) {
        self.send(ControlRequest::RestartConsole);
    }

    /// Member names of `expression` evaluated in the current backend.
    ///
    /// Best effort: empty when no backend is current, or when the lookup
    /// failed or took longer than `member_lookup_timeout`.
    pub async fn get_member_names(&self, expression: &str) -> Vec<String> {
        let (reply, names) = oneshot::channel();
        let request = ControlRequest::MemberNames {
            expression: expression.to_string(),
            reply,
        };
        if !self.send(request) {
            return Vec::new();
        }
        names.await.unwrap_or_default()
    }

    /// Execute a command in the current backend and wait for its output.
    pub async fn execute(
        &self,
        command: CompiledCommand,
        scope: Option<ScopeHandle>,
    ) -> Result<Option<String>, DispatchError> {
        let (reply, result) = oneshot::channel();
        if !self.send(ControlRequest::Execute {
            command,
            scope,
            reply,
        }) {
            return Err(DispatchError::Unreachable(ChannelError::NoBackend));
        }
        result
            .await
            .unwrap_or(Err(DispatchError::Unreachable(ChannelError::Disconnected)))
    }

    pub async fn create_scope(&self) -> Result<ScopeHandle, DispatchError> {
        let (reply, result) = oneshot::channel();
        if !self.send(ControlRequest::CreateScope { reply }) {
            return Err(DispatchError::Unreachable(ChannelError::NoBackend));
        }
        result
            .await
            .unwrap_or(Err(DispatchError::Unreachable(ChannelError::Disconnected)))
    }

    /// Stop the supervisor and wait for its loop to finish.
    ///
    /// When this returns, no backend is running and none will be created.
    pub async fn terminate(&self) {
        if let Some(supervisor_loop) = lock(&self.pending).take() {
            drop(supervisor_loop);
            self.state_tx.send_modify(|state| {
                state.phase = SupervisorPhase::Stopped;
                state.current = None;
            });
            return;
        }

        self.send(ControlRequest::Terminate);

        let handle = lock(&self.handle).take();
        match handle {
            Some(handle) => {
                if let Err(err) = handle.await {
                    error!(error = %err, "supervisor loop ended abnormally");
                }
            }
            None => {
                // Someone else is joining the loop; wait for it to report.
                let mut state = self.state_rx.clone();
                let _ = state.wait_for(SupervisorState::is_stopped).await;
            }
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state_rx.borrow().clone()
    }

    pub fn current_instance(&self) -> Option<InstanceId> {
        self.state_rx.borrow().current
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state_rx.clone()
    }

    /// Wait up to `within` for a state matching `predicate`.
    pub async fn wait_for_state<F>(&self, within: Duration, mut predicate: F) -> Option<SupervisorState>
    where
        F: FnMut(&SupervisorState) -> bool,
    {
        let mut state = self.state_rx.clone();
        let waited = tokio::time::timeout(within, async {
            state.wait_for(|s| predicate(s)).await.map(|s| s.clone()).ok()
        })
        .await;
        waited.ok().flatten()
    }

    /// Wait up to `within` for a backend to become current.
    pub async fn wait_for_instance(&self, within: Duration) -> Option<InstanceId> {
        self.wait_for_state(within, |s| s.current.is_some() || s.is_terminating())
            .await
            .and_then(|s| s.current)
    }

    fn send(&self, request: ControlRequest) -> bool {
        match self.control_tx.send(request) {
            Ok(()) => true,
            Err(err) => {
                debug!(request = ?err.0, "supervisor loop is gone; request dropped");
                false
            }
        }
    }
}
