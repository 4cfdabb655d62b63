use std::path::{Path, PathBuf};

use crate::config::types::PycellConfig;
use crate::error::{PycellError, Result};

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "pycell", "pycell") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        // Fallback to home directory
        dirs_fallback().join(".pycell").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values
pub fn load_config(config_path: Option<&Path>) -> Result<PycellConfig> {
    let path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(get_config_path);

    if !path.exists() {
        // Return defaults if no config file exists
        return Ok(PycellConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config: PycellConfig =
        toml::from_str(&content).map_err(|e| PycellError::TomlParse(e.to_string()))?;

    Ok(config)
}

/// Get the data directory holding workspaces and the dataset store
pub fn get_data_dir() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "pycell", "pycell") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        dirs_fallback().join(".local").join("share").join("pycell")
    }
}
