//! Model types
//!
//! Defines loaded-model metadata and the lifecycle status reported to clients.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Information about a loaded model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Path the model was loaded from
    pub path: PathBuf,
    /// Number of entries in the model vocabulary
    pub vocab_size: usize,
    /// Context window of the live context, in tokens
    pub context_size: usize,
}

/// Whether a model is currently resident
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelStatus {
    NotLoaded,
    Loaded(ModelInfo),
}

impl ModelStatus {
    pub fn is_loaded(&self) -> bool {
        matches!(self, ModelStatus::Loaded(_))
    }

    /// Status line sent back for the STATUS command
    pub fn describe(&self) -> String {
        match self {
            ModelStatus::NotLoaded => "No model loaded".to_string(),
            ModelStatus::Loaded(info) => format!("Model loaded: {}", info.path.display()),
        }
    }
}
