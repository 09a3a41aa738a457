//! llama.cpp backend
//!
//! [`InferenceBackend`] implementation on top of the llama-cpp-2 crate.
//!
//! # Context lifetime
//!
//! `LlamaContext<'a>` borrows the `LlamaModel` it was created from, but the
//! lifecycle manager stores the model and context side by side. The model is
//! therefore kept behind an `Arc`, and the context handle holds its own clone
//! of that `Arc` so the weights outlive the context no matter in which order
//! the manager drops things.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::token::LlamaToken;

use crate::inference::backend::{BackendError, InferenceBackend, TokenBatch, TokenId};
use crate::types::config::{ContextParams, ModelParams};

/// Global llama.cpp backend (can only be initialized once per process)
static LLAMA_BACKEND: OnceLock<Result<LlamaBackend, String>> = OnceLock::new();

fn backend() -> Result<&'static LlamaBackend, BackendError> {
    let result = LLAMA_BACKEND.get_or_init(|| {
        let mut backend = LlamaBackend::init().map_err(|e| e.to_string())?;
        backend.void_logs();
        Ok(backend)
    });
    match result {
        Ok(backend) => Ok(backend),
        Err(e) => Err(BackendError::Init(e.clone())),
    }
}

/// Model handle
pub struct LlamaModelHandle {
    model: Arc<LlamaModel>,
}

/// Context handle, bound to the model it was created from
pub struct LlamaContextHandle {
    // Field order matters: the context drops before its model reference.
    context: LlamaContext<'static>,
    _model: Arc<LlamaModel>,
    n_vocab: usize,
    n_batch: usize,
}

// SAFETY: the context is only ever touched by the thread currently holding the
// service lock, never concurrently, and the model it points to is pinned by
// the `Arc` stored alongside it.
unsafe impl Send for LlamaContextHandle {}

/// llama.cpp adapter
#[derive(Debug, Default)]
pub struct LlamaCppBackend;

impl LlamaCppBackend {
    pub fn new() -> Self {
        Self
    }
}

impl InferenceBackend for LlamaCppBackend {
    type Model = LlamaModelHandle;
    type Context = LlamaContextHandle;

    fn init(&mut self) -> Result<(), BackendError> {
        backend().map(|_| ())
    }

    fn load_model(&mut self, path: &Path, params: &ModelParams) -> Result<LlamaModelHandle, BackendError> {
        if !path.is_file() {
            return Err(BackendError::InvalidPath(path.display().to_string()));
        }

        // llama.cpp defaults otherwise: weights memory-mapped, not locked in RAM
        let model_params = LlamaModelParams::default().with_n_gpu_layers(params.gpu_layers);

        let model = LlamaModel::load_from_file(backend()?, path, &model_params)
            .map_err(|e| BackendError::ModelLoad(e.to_string()))?;

        tracing::info!(
            "llama.cpp model loaded: {} params, {} vocab, {} training ctx",
            model.n_params(),
            model.n_vocab(),
            model.n_ctx_train()
        );

        Ok(LlamaModelHandle {
            model: Arc::new(model),
        })
    }

    fn create_context(
        &mut self,
        model: &LlamaModelHandle,
        params: &ContextParams,
    ) -> Result<LlamaContextHandle, BackendError> {
        // The whole prompt is prefilled in one decode call, so the logical
        // batch spans the window; `batch_size` only sets the micro-batch.
        let n_batch = params.context_size.max(1);
        let n_ubatch = params.batch_size.clamp(1, n_batch);
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(params.context_size))
            .with_n_batch(n_batch)
            .with_n_ubatch(n_ubatch)
            .with_n_threads(params.threads as i32)
            .with_n_threads_batch(params.threads as i32);

        let context = model
            .model
            .new_context(backend()?, ctx_params)
            .map_err(|e| BackendError::ContextCreate(e.to_string()))?;

        // SAFETY: the `'static` lifetime is a lie the handle keeps true: it
        // owns an `Arc` of the model, declared after the context so the
        // context is dropped first.
        let context: LlamaContext<'static> = unsafe { std::mem::transmute(context) };

        Ok(LlamaContextHandle {
            context,
            _model: model.model.clone(),
            n_vocab: model.model.n_vocab().max(0) as usize,
            n_batch: n_batch as usize,
        })
    }

    fn tokenize(&self, model: &LlamaModelHandle, text: &str, add_bos: bool) -> Result<Vec<TokenId>, BackendError> {
        let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
        let tokens = model
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| BackendError::Tokenize(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn reset_context(&self, context: &mut LlamaContextHandle) {
        context.context.clear_kv_cache();
    }

    fn decode(&self, context: &mut LlamaContextHandle, batch: &TokenBatch) -> Result<(), BackendError> {
        let mut llama_batch = LlamaBatch::new(batch.len().max(1), 1);
        for entry in batch.entries() {
            llama_batch
                .add(LlamaToken::new(entry.token), entry.pos, &[0], entry.logits)
                .map_err(|e| BackendError::Decode(format!("Failed to add token to batch: {}", e)))?;
        }

        context
            .context
            .decode(&mut llama_batch)
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    fn max_batch_tokens(&self, context: &LlamaContextHandle) -> usize {
        context.n_batch
    }

    fn logits<'c>(&self, context: &'c LlamaContextHandle) -> &'c [f32] {
        let logits = context.context.get_logits();
        &logits[..context.n_vocab.min(logits.len())]
    }

    fn token_to_bytes(&self, model: &LlamaModelHandle, token: TokenId) -> Result<Vec<u8>, BackendError> {
        model
            .model
            .token_to_bytes(LlamaToken::new(token), Special::Tokenize)
            .map_err(|e| BackendError::Detokenize(e.to_string()))
    }

    fn eos_token(&self, model: &LlamaModelHandle) -> TokenId {
        model.model.token_eos().0
    }

    fn vocab_size(&self, model: &LlamaModelHandle) -> usize {
        model.model.n_vocab().max(0) as usize
    }

    fn context_size(&self, context: &LlamaContextHandle) -> usize {
        context.context.n_ctx() as usize
    }

    fn free_context(&mut self, context: LlamaContextHandle) {
        drop(context);
    }

    fn free_model(&mut self, model: LlamaModelHandle) {
        drop(model);
    }
}
