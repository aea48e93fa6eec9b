//! Configuration file discovery for converge
//!
//! The reconciliation core is a library, so this crate only locates a YAML
//! file and hands back whatever type the caller asks for.

pub mod error;

pub use error::*;

use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Environment variable that points directly at a config file
pub const CONFIG_PATH_ENV: &str = "CONVERGE_CONFIG_PATH";

const APP_DIR: &str = "converge";
const PROJECT_DIR: &str = ".converge";
const GLOBAL_FILE: &str = "converge.yaml";
const CANDIDATES: [&str; 4] = [
    "converge.local.yaml",
    ".converge.local.yaml",
    "converge.yaml",
    ".converge.yaml",
];

/// Find the converge config file
///
/// Search order:
/// 1. `CONVERGE_CONFIG_PATH` (direct path)
/// 2. Current directory: converge.local.yaml, .converge.local.yaml, converge.yaml, .converge.yaml
/// 3. `./.converge/`: same order
/// 4. `~/.config/converge/converge.yaml` (global)
pub fn find_config_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!(
            "{} points at {} which does not exist, continuing search",
            CONFIG_PATH_ENV,
            path.display()
        );
    }

    let current_dir = std::env::current_dir()?;

    if let Some(path) = first_existing(&current_dir) {
        return Ok(path);
    }

    let project_dir = current_dir.join(PROJECT_DIR);
    if project_dir.is_dir() {
        if let Some(path) = first_existing(&project_dir) {
            return Ok(path);
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join(APP_DIR).join(GLOBAL_FILE);
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::ConfigFileNotFound)
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    CANDIDATES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
}

/// Parse a YAML config file into `T`
pub fn load_from_path<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)?;
    let value = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!("Loaded config from {}", path.display());
    Ok(value)
}

/// Find and parse the config file, returning `None` when there is no file
pub fn load<T: DeserializeOwned>() -> Result<Option<T>> {
    match find_config_file() {
        Ok(path) => load_from_path(&path).map(Some),
        Err(ConfigError::ConfigFileNotFound) => Ok(None),
        Err(e) => Err(e),
    }
}
