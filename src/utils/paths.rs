//! Cross-Platform Path Utilities
//!
//! Functions for resolving the engine's data directory (~/.forgeflow/).

use std::path::{Path, PathBuf};

use crate::utils::error::{AppError, AppResult};

/// Get the user's home directory
pub fn home_dir() -> AppResult<PathBuf> {
    dirs::home_dir().ok_or_else(|| AppError::config("Could not determine home directory"))
}

/// Get the Forgeflow directory (~/.forgeflow/)
pub fn forgeflow_dir() -> AppResult<PathBuf> {
    Ok(home_dir()?.join(".forgeflow"))
}

/// Get the config file path (~/.forgeflow/config.json)
pub fn config_path() -> AppResult<PathBuf> {
    Ok(forgeflow_dir()?.join("config.json"))
}

/// Get the database file path (~/.forgeflow/sessions.db)
pub fn database_path() -> AppResult<PathBuf> {
    Ok(forgeflow_dir()?.join("sessions.db"))
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> AppResult<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Get the Forgeflow directory, creating it if it doesn't exist
pub fn ensure_forgeflow_dir() -> AppResult<PathBuf> {
    let path = forgeflow_dir()?;
    ensure_dir(&path)?;
    Ok(path)
}
