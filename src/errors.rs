// src/errors.rs

//! Errors raised while loading configuration.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplvisorError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, ReplvisorError>;
