//! Inference error taxonomy

use thiserror::Error;

use crate::inference::backend::BackendError;

/// Errors that can occur during lifecycle and generation operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("No model path provided")]
    EmptyPath,

    #[error("No prompt provided")]
    EmptyPrompt,

    #[error("No model loaded")]
    NoModelLoaded,

    #[error("Invalid model path: {0}")]
    InvalidPath(String),

    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Failed to tokenize prompt: {0}")]
    Tokenization(String),

    #[error("Failed to evaluate prompt: {0}")]
    Decode(String),

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

impl EngineError {
    /// True for the failures that leave the manager unloaded after LOAD
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidPath(_)
                | EngineError::BackendInit(_)
                | EngineError::ModelLoad(_)
                | EngineError::ContextCreate(_)
        )
    }
}

impl From<BackendError> for EngineError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Init(msg) => EngineError::BackendInit(msg),
            BackendError::InvalidPath(path) => EngineError::InvalidPath(path),
            BackendError::ModelLoad(msg) => EngineError::ModelLoad(msg),
            BackendError::ContextCreate(msg) => EngineError::ContextCreate(msg),
            BackendError::Tokenize(msg) => EngineError::Tokenization(msg),
            BackendError::Decode(msg) | BackendError::Detokenize(msg) => EngineError::Decode(msg),
        }
    }
}
