//! LLM inference
//!
//! This module owns the model lifecycle and the generation loop, and talks to
//! the inference backend (llama.cpp via llama-cpp-2 when the `llama` feature is on).

pub mod backend;
pub mod engine;
pub mod error;
pub mod lifecycle;
#[cfg(feature = "llama")]
pub mod llama;
#[cfg(test)]
pub(crate) mod mock;
pub mod service;
pub mod streaming;

// Re-export main types for convenience
pub use backend::{BackendError, InferenceBackend, TokenBatch, TokenId};
pub use engine::{greedy_argmax, GenerationEngine, GenerationParams, GenerationSummary, StopReason};
pub use error::EngineError;
pub use lifecycle::ModelManager;
#[cfg(feature = "llama")]
pub use llama::LlamaCppBackend;
pub use service::{InferenceService, PendingCompletion};
pub use streaming::StreamToken;
