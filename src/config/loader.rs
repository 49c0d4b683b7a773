// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::{ConfigFile, ConfigOverrides, RawConfigFile};
use crate::errors::Result;

/// Load a configuration file and return the raw, unvalidated `RawConfigFile`.
///
/// This only performs TOML deserialization. Use [`load_and_validate`] for
/// the checked form.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawConfigFile = toml::from_str(&contents)?;

    Ok(config)
}

/// Load a configuration file from path and validate it.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let raw_config = load_from_path(&path)?;
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

/// Resolve the effective configuration for the service.
///
/// - An explicit `path` must exist.
/// - Without one, `Taskforge.toml` in the working directory is used if
///   present, otherwise built-in defaults.
/// - `overrides` are applied before validation.
pub fn load_effective(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<ConfigFile> {
    let mut raw = match path {
        Some(p) => load_from_path(p)?,
        None => {
            let default = default_config_path();
            if default.is_file() {
                load_from_path(&default)?
            } else {
                debug!(path = %default.display(), "no config file found; using defaults");
                RawConfigFile::default()
            }
        }
    };
    raw.apply_overrides(overrides);
    ConfigFile::try_from(raw)
}

/// `Taskforge.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Taskforge.toml")
}
