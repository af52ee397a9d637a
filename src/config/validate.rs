// src/config/validate.rs

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{ReplvisorError, Result};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = ReplvisorError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw.supervisor, raw.backend))
    }
}

pub fn validate_config(cfg: &RawConfigFile) -> Result<()> {
    validate_supervisor(cfg)?;
    validate_backend(cfg)?;
    Ok(())
}

fn validate_supervisor(cfg: &RawConfigFile) -> Result<()> {
    if cfg.supervisor.startup_timeout_ms == 0 {
        return Err(ReplvisorError::ConfigError(
            "[supervisor].startup_timeout_ms must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.supervisor.terminate_grace_ms == 0 {
        return Err(ReplvisorError::ConfigError(
            "[supervisor].terminate_grace_ms must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.supervisor.member_lookup_timeout_ms == 0 {
        return Err(ReplvisorError::ConfigError(
            "[supervisor].member_lookup_timeout_ms must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_backend(cfg: &RawConfigFile) -> Result<()> {
    if let Some(program) = &cfg.backend.program {
        if program.as_os_str().is_empty() {
            return Err(ReplvisorError::ConfigError(
                "[backend].program must not be empty".to_string(),
            ));
        }
    }
    if cfg.backend.lease_timeout_secs == 0 {
        return Err(ReplvisorError::ConfigError(
            "[backend].lease_timeout_secs must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}
