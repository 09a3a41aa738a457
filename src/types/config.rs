//! Configuration types
//!
//! Fixed parameters handed to the backend when a model and its context are built.

use serde::{Deserialize, Serialize};

/// Parameters used when loading model weights
///
/// Weights are always memory-mapped and never locked in RAM (the llama.cpp
/// defaults), so several bridges can share a host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Number of layers to offload to GPU (0 = CPU only)
    pub gpu_layers: u32,
}

/// Parameters used when creating the inference context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextParams {
    /// Context window size in tokens
    pub context_size: u32,
    /// Number of threads used for decoding
    pub threads: u32,
    /// Physical micro-batch size; a single decode call may still carry a
    /// whole context window of tokens
    pub batch_size: u32,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            context_size: 2048,
            threads: 4,
            batch_size: 512,
        }
    }
}
