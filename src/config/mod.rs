// src/config/mod.rs

//! Configuration loading and validation.
//!
//! - `model.rs` defines the TOML-backed raw model and the validated
//!   `ConfigFile`.
//! - `loader.rs` reads files and applies command-line overrides.
//! - `validate.rs` turns raw values (durations, regexes, addresses) into
//!   checked ones.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_effective, load_from_path};
pub use model::{ConfigFile, ConfigOverrides, RawConfigFile, ServiceConfig};
pub use validate::parse_duration;
