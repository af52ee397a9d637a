// src/config/mod.rs

//! Configuration for replvisor.
//!
//! - `model.rs`: the TOML-backed data model and its conversion into
//!   supervisor and process options.
//! - `loader.rs`: reading a config file from disk.
//! - `validate.rs`: sanity checks on raw values.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path, load_or_default};
pub use model::{BackendSection, ConfigFile, RawConfigFile, SupervisorSection};
pub use validate::validate_config;
