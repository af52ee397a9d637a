#![allow(dead_code)]

use std::time::Duration;

use replvisor::config::{ConfigFile, RawConfigFile};
use replvisor::supervisor::SupervisorOptions;
use replvisor::types::RestartMode;

/// Builder for `SupervisorOptions` with timings suited to tests.
pub struct OptionsBuilder {
    options: SupervisorOptions,
}

impl OptionsBuilder {
    pub fn new() -> Self {
        Self {
            options: SupervisorOptions {
                exit_on_normal_exit: false,
                startup_timeout: Duration::from_secs(2),
                restart_delay: Duration::from_millis(10),
                run_args: Vec::new(),
                member_lookup_timeout: Duration::from_secs(1),
            },
        }
    }

    pub fn exit_on_normal_exit(mut self, val: bool) -> Self {
        self.options.exit_on_normal_exit = val;
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.options.startup_timeout = timeout;
        self
    }

    pub fn restart_delay(mut self, delay: Duration) -> Self {
        self.options.restart_delay = delay;
        self
    }

    pub fn run_arg(mut self, arg: &str) -> Self {
        self.options.run_args.push(arg.to_string());
        self
    }

    pub fn member_lookup_timeout(mut self, bound: Duration) -> Self {
        self.options.member_lookup_timeout = bound;
        self
    }

    pub fn build(self) -> SupervisorOptions {
        self.options
    }
}

impl Default for OptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile::default(),
        }
    }

    pub fn restart(mut self, mode: RestartMode) -> Self {
        self.config.supervisor.restart = mode;
        self
    }

    pub fn startup_timeout_ms(mut self, ms: u64) -> Self {
        self.config.supervisor.startup_timeout_ms = ms;
        self
    }

    pub fn program(mut self, program: &str) -> Self {
        self.config.backend.program = Some(program.into());
        self
    }

    pub fn run_arg(mut self, arg: &str) -> Self {
        self.config.backend.run_args.push(arg.to_string());
        self
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}
