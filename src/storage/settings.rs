//! Settings storage
//!
//! Manages the bridge configuration file: socket location, session log, and the
//! fixed model/context/generation parameters.

use crate::storage::{get_data_dir, StorageError};
use crate::types::config::{ContextParams, ModelParams};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default location of the listening socket
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/llama-cpp-bridge.sock";

/// Bridge settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Path of the Unix domain socket the bridge listens on
    pub socket_path: PathBuf,
    /// Append-only diagnostic log
    pub log_file: PathBuf,
    /// Context window size
    pub context_size: u32,
    /// Number of threads used for decoding
    pub threads: u32,
    /// Prompt evaluation micro-batch size
    pub batch_size: u32,
    /// Maximum number of tokens generated per request
    pub max_new_tokens: u32,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
}

fn default_log_file() -> PathBuf {
    get_data_dir()
        .ok()
        .map(|d| d.join("worker_log.txt"))
        .unwrap_or_else(|| PathBuf::from("worker_log.txt"))
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            log_file: default_log_file(),
            context_size: 2048,
            threads: 4,
            batch_size: 512,
            max_new_tokens: 128,
            gpu_layers: 0,
        }
    }
}

impl BridgeSettings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges.
    pub fn validate(&mut self) {
        self.context_size = self.context_size.clamp(128, 131072);

        if self.threads == 0 {
            self.threads = 4;
        }

        self.batch_size = self.batch_size.clamp(1, self.context_size);

        // A request can never produce more tokens than the window holds
        self.max_new_tokens = self.max_new_tokens.clamp(1, self.context_size);

        if self.socket_path.as_os_str().is_empty() {
            self.socket_path = PathBuf::from(DEFAULT_SOCKET_PATH);
        }
    }

    pub fn model_params(&self) -> ModelParams {
        ModelParams {
            gpu_layers: self.gpu_layers,
        }
    }

    pub fn context_params(&self) -> ContextParams {
        ContextParams {
            context_size: self.context_size,
            threads: self.threads,
            batch_size: self.batch_size,
        }
    }
}

/// Get the default settings file path
pub fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings(path: Option<&Path>) -> BridgeSettings {
    match load_settings_internal(path) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            BridgeSettings::default()
        }
    }
}

/// Internal settings loading with error propagation
fn load_settings_internal(path: Option<&Path>) -> Result<BridgeSettings, StorageError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => get_settings_path()?,
    };

    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(BridgeSettings::default());
    }

    let json = fs::read_to_string(&path)?;
    let mut settings: BridgeSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {:?}", path);
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &BridgeSettings, path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {:?}", path);
    Ok(())
}
