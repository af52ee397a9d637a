// src/config/model.rs

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::backend::ProcessOptions;
use crate::supervisor::SupervisorOptions;
use crate::types::RestartMode;

/// Top-level configuration as read from `Replvisor.toml`.
///
/// ```toml
/// [supervisor]
/// restart = "on-failure"
/// startup_timeout_ms = 5000
///
/// [backend]
/// program = "/usr/local/bin/replvisor"
/// args = ["serve-backend"]
/// ```
///
/// Every section and key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub supervisor: SupervisorSection,

    #[serde(default)]
    pub backend: BackendSection,
}

/// `[supervisor]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorSection {
    /// `"always"` (default) or `"on-failure"`.
    #[serde(default)]
    pub restart: RestartMode,

    /// Bound on spawning a backend and completing its handshake.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Pause after a failed startup before the next attempt.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    /// Time a backend gets to exit after a terminate before it is killed.
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,

    /// Bound on a `:members` lookup; an unanswered lookup lists nothing.
    #[serde(default = "default_member_lookup_timeout_ms")]
    pub member_lookup_timeout_ms: u64,
}

fn default_startup_timeout_ms() -> u64 {
    10_000
}

fn default_restart_delay_ms() -> u64 {
    250
}

fn default_terminate_grace_ms() -> u64 {
    2_000
}

fn default_member_lookup_timeout_ms() -> u64 {
    2_000
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            restart: RestartMode::default(),
            startup_timeout_ms: default_startup_timeout_ms(),
            restart_delay_ms: default_restart_delay_ms(),
            terminate_grace_ms: default_terminate_grace_ms(),
            member_lookup_timeout_ms: default_member_lookup_timeout_ms(),
        }
    }
}

/// `[backend]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendSection {
    /// Program to spawn for each backend. `None` means this executable.
    #[serde(default)]
    pub program: Option<PathBuf>,

    #[serde(default = "default_backend_args")]
    pub args: Vec<String>,

    /// Arguments handed to each backend when it starts running.
    #[serde(default)]
    pub run_args: Vec<String>,

    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,
}

fn default_backend_args() -> Vec<String> {
    vec!["serve-backend".to_string()]
}

fn default_lease_timeout_secs() -> u64 {
    7 * 24 * 60 * 60
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            program: None,
            args: default_backend_args(),
            run_args: Vec::new(),
            lease_timeout_secs: default_lease_timeout_secs(),
        }
    }
}

/// Validated configuration. Only built through `TryFrom<RawConfigFile>`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub supervisor: SupervisorSection,
    pub backend: BackendSection,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(supervisor: SupervisorSection, backend: BackendSection) -> Self {
        Self {
            supervisor,
            backend,
        }
    }

    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            exit_on_normal_exit: self.supervisor.restart.exit_on_normal_exit(),
            startup_timeout: Duration::from_millis(self.supervisor.startup_timeout_ms),
            restart_delay: Duration::from_millis(self.supervisor.restart_delay_ms),
            run_args: self.backend.run_args.clone(),
            member_lookup_timeout: Duration::from_millis(self.supervisor.member_lookup_timeout_ms),
        }
    }

    /// Process options, with `current_exe` standing in for a missing program.
    pub fn process_options(&self, current_exe: PathBuf) -> ProcessOptions {
        let program = self.backend.program.clone().unwrap_or(current_exe);
        let mut options = ProcessOptions::new(program, self.backend.args.clone());
        options.lease_timeout = Duration::from_secs(self.backend.lease_timeout_secs);
        options.terminate_grace = Duration::from_millis(self.supervisor.terminate_grace_ms);
        options
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self::new_unchecked(SupervisorSection::default(), BackendSection::default())
    }
}
