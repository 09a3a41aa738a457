//! Persistent storage
//!
//! This module handles the settings file and the diagnostic session log.

pub mod session_log;
pub mod settings;

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while reading or writing bridge files
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Could not determine a data directory for this platform")]
    NoDataDir,
}

/// Directory holding the bridge's settings and log files
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "LlamaBridge", "llama-bridge")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StorageError::NoDataDir)
}
