//! Backend adapter
//!
//! The inference engine behind the bridge is an opaque capability set: it loads
//! weights, builds a context, tokenizes, decodes batches and exposes logits. The
//! lifecycle manager and the generation engine only ever talk to it through
//! [`InferenceBackend`].

use std::path::Path;

use thiserror::Error;

use crate::types::config::{ContextParams, ModelParams};

/// Vocabulary token id
pub type TokenId = i32;

/// Errors reported by a backend implementation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("{0}")]
    Init(String),

    #[error("{0}")]
    InvalidPath(String),

    #[error("{0}")]
    ModelLoad(String),

    #[error("{0}")]
    ContextCreate(String),

    #[error("{0}")]
    Tokenize(String),

    #[error("{0}")]
    Decode(String),

    #[error("{0}")]
    Detokenize(String),
}

/// One token slot in a decode batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: TokenId,
    /// Sequence position of the token
    pub pos: i32,
    /// Whether logits are requested for this position
    pub logits: bool,
}

/// A batch of tokens submitted to a single decode call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenBatch {
    entries: Vec<BatchEntry>,
}

impl TokenBatch {
    /// Batch covering a whole prompt starting at position 0, with logits only
    /// requested for the final token
    pub fn prompt(tokens: &[TokenId]) -> Self {
        let last = tokens.len().saturating_sub(1);
        let entries = tokens
            .iter()
            .enumerate()
            .map(|(i, &token)| BatchEntry {
                token,
                pos: i as i32,
                logits: i == last,
            })
            .collect();
        Self { entries }
    }

    /// Batch holding one token at `pos`, logits requested
    pub fn single(token: TokenId, pos: i32) -> Self {
        Self {
            entries: vec![BatchEntry {
                token,
                pos,
                logits: true,
            }],
        }
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Capability set of an inference backend
///
/// `Model` and `Context` are opaque handles owned by the lifecycle manager. A
/// context is always created from, and freed before, its model.
pub trait InferenceBackend: Send + 'static {
    type Model: Send;
    type Context: Send;

    /// Process-wide backend initialization. Called at most once per manager.
    fn init(&mut self) -> Result<(), BackendError>;

    fn load_model(&mut self, path: &Path, params: &ModelParams) -> Result<Self::Model, BackendError>;

    fn create_context(
        &mut self,
        model: &Self::Model,
        params: &ContextParams,
    ) -> Result<Self::Context, BackendError>;

    fn tokenize(&self, model: &Self::Model, text: &str, add_bos: bool) -> Result<Vec<TokenId>, BackendError>;

    /// Forget every token decoded so far so the next batch starts at position 0
    fn reset_context(&self, context: &mut Self::Context);

    fn decode(&self, context: &mut Self::Context, batch: &TokenBatch) -> Result<(), BackendError>;

    /// Largest number of tokens a single `decode` call accepts
    fn max_batch_tokens(&self, context: &Self::Context) -> usize;

    /// Logits of the last position that requested them, one score per vocabulary entry
    fn logits<'c>(&self, context: &'c Self::Context) -> &'c [f32];

    fn token_to_bytes(&self, model: &Self::Model, token: TokenId) -> Result<Vec<u8>, BackendError>;

    fn eos_token(&self, model: &Self::Model) -> TokenId;

    fn vocab_size(&self, model: &Self::Model) -> usize;

    fn context_size(&self, context: &Self::Context) -> usize;

    fn free_context(&mut self, context: Self::Context);

    fn free_model(&mut self, model: Self::Model);
}
