// src/supervisor/state.rs

//! Pure supervisor state machine.
//!
//! [`LoopCore`] holds every decision the supervisor loop makes: which
//! instance is current, whether termination was requested, and whether a
//! backend that just exited gets replaced. It has no channels, no Tokio
//! types and performs no IO, so it is tested directly.
//!
//! The published [`SupervisorState`] only ever takes these shapes:
//!
//! ```text
//! phase        current
//! NotStarted   None        constructed, loop not launched
//! Running      None        starting (or between) backends
//! Running      Some(id)    backend `id` is current
//! Terminating  None        terminate requested, backend being torn down
//! Stopped      None        loop has returned
//! ```

use crate::backend::InstanceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorPhase {
    NotStarted,
    Running,
    Terminating,
    Stopped,
}

/// Snapshot of the supervisor, published as one value so readers never see
/// a current instance together with a termination request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorState {
    pub phase: SupervisorPhase,
    pub current: Option<InstanceId>,
    /// Number of backends that became current so far.
    pub instances_started: u64,
}

impl SupervisorState {
    pub fn not_started() -> Self {
        Self {
            phase: SupervisorPhase::NotStarted,
            current: None,
            instances_started: 0,
        }
    }

    pub fn is_terminating(&self) -> bool {
        matches!(
            self.phase,
            SupervisorPhase::Terminating | SupervisorPhase::Stopped
        )
    }

    pub fn is_stopped(&self) -> bool {
        self.phase == SupervisorPhase::Stopped
    }
}

/// What the loop does once the current backend has exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterExit {
    Restart,
    Stop,
}

#[derive(Debug, Clone)]
pub struct LoopCore {
    exit_on_normal_exit: bool,
    restart_requested: bool,
    next_instance: u64,
    state: SupervisorState,
}

impl LoopCore {
    pub fn new(exit_on_normal_exit: bool) -> Self {
        Self {
            exit_on_normal_exit,
            restart_requested: false,
            next_instance: 1,
            state: SupervisorState::not_started(),
        }
    }

    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    pub fn current(&self) -> Option<InstanceId> {
        self.state.current
    }

    pub fn is_terminating(&self) -> bool {
        self.state.is_terminating()
    }

    /// Allocate the identity for the next startup attempt.
    pub fn begin_attempt(&mut self) -> InstanceId {
        let id = InstanceId(self.next_instance);
        self.next_instance += 1;
        if !self.is_terminating() {
            self.state.phase = SupervisorPhase::Running;
        }
        self.state.current = None;
        id
    }

    pub fn instance_ready(&mut self, id: InstanceId) {
        self.restart_requested = false;
        if !self.is_terminating() {
            self.state.instances_started += 1;
            self.state.current = Some(id);
        }
    }

    /// Record a restart request. Returns `false` when there is no current
    /// instance to restart.
    pub fn request_restart(&mut self) -> bool {
        if self.state.current.is_none() {
            return false;
        }
        self.restart_requested = true;
        true
    }

    /// Record a terminate request. Returns `true` the first time.
    pub fn request_terminate(&mut self) -> bool {
        if self.is_terminating() {
            return false;
        }
        self.state.phase = SupervisorPhase::Terminating;
        self.state.current = None;
        true
    }

    pub fn instance_exited(&mut self, exit_code: i32) -> AfterExit {
        self.state.current = None;
        let restart_requested = std::mem::take(&mut self.restart_requested);

        if self.is_terminating() {
            AfterExit::Stop
        } else if restart_requested {
            AfterExit::Restart
        } else if self.exit_on_normal_exit && exit_code == 0 {
            AfterExit::Stop
        } else {
            AfterExit::Restart
        }
    }

    pub fn stopped(&mut self) {
        self.state.phase = SupervisorPhase::Stopped;
        self.state.current = None;
    }
}
