//! Scripted backend for tests
//!
//! Whitespace tokenizer over a tiny fixed vocabulary. After every single-token
//! decode the logits are one-hot on the next scripted token (EOS once the
//! script runs out), so generations are fully deterministic. Failures can be
//! injected at each lifecycle step.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::inference::backend::{BackendError, InferenceBackend, TokenBatch, TokenId};
use crate::types::config::{ContextParams, ModelParams};

pub const BOS: TokenId = 1;
pub const EOS: TokenId = 2;
pub const UNK: TokenId = 3;
pub const HELLO: TokenId = 4;
pub const WORLD: TokenId = 5;
pub const FROM: TokenId = 6;
pub const THE: TokenId = 7;
pub const BRIDGE: TokenId = 8;
pub const BANG: TokenId = 9;
pub const E_ACUTE_HEAD: TokenId = 10;
pub const E_ACUTE_TAIL: TokenId = 11;
pub const NEWLINE: TokenId = 12;
pub const QUOTE: TokenId = 13;

const VOCAB: &[&[u8]] = &[
    b"<pad>",
    b"<s>",
    b"</s>",
    b"<unk>",
    b" hello",
    b" world",
    b" from",
    b" the",
    b" bridge",
    b"!",
    &[0xC3],
    &[0xA9],
    b"\n",
    b"\"",
];

/// Shared counters observed by tests after the backend moved into a manager
#[derive(Debug, Default)]
pub struct Probe {
    init_calls: AtomicUsize,
    live_models: AtomicUsize,
    max_live_models: AtomicUsize,
    live_contexts: AtomicUsize,
    inference_calls: AtomicUsize,
    positions: Mutex<Vec<Vec<i32>>>,
    freed_models: Mutex<Vec<PathBuf>>,
}

impl Probe {
    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn live_models(&self) -> usize {
        self.live_models.load(Ordering::SeqCst)
    }

    pub fn max_live_models(&self) -> usize {
        self.max_live_models.load(Ordering::SeqCst)
    }

    pub fn live_contexts(&self) -> usize {
        self.live_contexts.load(Ordering::SeqCst)
    }

    /// Tokenize and decode calls made so far
    pub fn inference_calls(&self) -> usize {
        self.inference_calls.load(Ordering::SeqCst)
    }

    /// Paths of freed models, in the order they were freed
    pub fn freed_models(&self) -> Vec<PathBuf> {
        self.freed_models.lock().unwrap().clone()
    }

    /// Positions of every decoded batch, most recent request only
    pub fn decoded_positions(&self) -> Vec<Vec<i32>> {
        self.positions.lock().unwrap().clone()
    }
}

pub struct ScriptedModel {
    path: PathBuf,
}

pub struct ScriptedContext {
    context_size: usize,
    batch_limit: usize,
    /// Decode calls since the last reset
    decodes: usize,
    /// Next position the context expects
    position: i32,
    logits: Vec<f32>,
}

pub struct ScriptedBackend {
    script: Vec<TokenId>,
    fail_init: bool,
    fail_load: Option<PathBuf>,
    fail_context: bool,
    fail_tokenize: bool,
    fail_decode_at: Option<usize>,
    batch_limit: Option<usize>,
    probe: Arc<Probe>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<TokenId>) -> Self {
        Self {
            script,
            fail_init: false,
            fail_load: None,
            fail_context: false,
            fail_tokenize: false,
            fail_decode_at: None,
            batch_limit: None,
            probe: Arc::new(Probe::default()),
        }
    }

    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn failing_load(mut self, path: impl Into<PathBuf>) -> Self {
        self.fail_load = Some(path.into());
        self
    }

    pub fn failing_context(mut self) -> Self {
        self.fail_context = true;
        self
    }

    pub fn failing_tokenize(mut self) -> Self {
        self.fail_tokenize = true;
        self
    }

    /// Fails the n-th decode call of each request (0 = prefill)
    pub fn failing_decode_at(mut self, n: usize) -> Self {
        self.fail_decode_at = Some(n);
        self
    }

    /// Caps the tokens one decode call accepts (the context size otherwise)
    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = Some(limit);
        self
    }

    pub fn probe(&self) -> Arc<Probe> {
        self.probe.clone()
    }
}

impl InferenceBackend for ScriptedBackend {
    type Model = ScriptedModel;
    type Context = ScriptedContext;

    fn init(&mut self) -> Result<(), BackendError> {
        self.probe.init_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_init {
            return Err(BackendError::Init("scripted init failure".into()));
        }
        Ok(())
    }

    fn load_model(&mut self, path: &Path, _params: &ModelParams) -> Result<ScriptedModel, BackendError> {
        if self.fail_load.as_deref() == Some(path) {
            return Err(BackendError::ModelLoad(format!("cannot read {}", path.display())));
        }
        let live = self.probe.live_models.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_live_models.fetch_max(live, Ordering::SeqCst);
        Ok(ScriptedModel {
            path: path.to_path_buf(),
        })
    }

    fn create_context(
        &mut self,
        _model: &ScriptedModel,
        params: &ContextParams,
    ) -> Result<ScriptedContext, BackendError> {
        if self.fail_context {
            return Err(BackendError::ContextCreate("scripted context failure".into()));
        }
        self.probe.live_contexts.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedContext {
            context_size: params.context_size as usize,
            batch_limit: self.batch_limit.unwrap_or(params.context_size as usize),
            decodes: 0,
            position: 0,
            logits: vec![0.0; VOCAB.len()],
        })
    }

    fn tokenize(&self, _model: &ScriptedModel, text: &str, add_bos: bool) -> Result<Vec<TokenId>, BackendError> {
        self.probe.inference_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_tokenize {
            return Err(BackendError::Tokenize("scripted tokenize failure".into()));
        }
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut tokens = Vec::new();
        if add_bos {
            tokens.push(BOS);
        }
        for word in text.split_whitespace() {
            let id = VOCAB
                .iter()
                .position(|piece| piece.strip_prefix(b" ") == Some(word.as_bytes()))
                .map(|i| i as TokenId)
                .unwrap_or(UNK);
            tokens.push(id);
        }
        Ok(tokens)
    }

    fn reset_context(&self, context: &mut ScriptedContext) {
        context.decodes = 0;
        context.position = 0;
        self.probe.positions.lock().unwrap().clear();
    }

    fn decode(&self, context: &mut ScriptedContext, batch: &TokenBatch) -> Result<(), BackendError> {
        self.probe.inference_calls.fetch_add(1, Ordering::SeqCst);
        let call = context.decodes;
        context.decodes += 1;

        if self.fail_decode_at == Some(call) {
            return Err(BackendError::Decode(format!("scripted decode failure at call {}", call)));
        }
        if batch.len() > context.batch_limit {
            return Err(BackendError::Decode(format!(
                "batch of {} tokens exceeds limit {}",
                batch.len(),
                context.batch_limit
            )));
        }

        let positions: Vec<i32> = batch.entries().iter().map(|e| e.pos).collect();
        if positions.first() != Some(&context.position) {
            return Err(BackendError::Decode("inconsistent sequence position".into()));
        }
        context.position += batch.len() as i32;
        self.probe.positions.lock().unwrap().push(positions);

        // The prefill's logits are never read; single-token steps follow the script
        let next = if batch.len() == 1 {
            call.checked_sub(1)
                .and_then(|step| self.script.get(step).copied())
                .unwrap_or(EOS)
        } else {
            UNK
        };
        context.logits.iter_mut().for_each(|l| *l = 0.0);
        context.logits[next as usize] = 10.0;
        Ok(())
    }

    fn max_batch_tokens(&self, context: &ScriptedContext) -> usize {
        context.batch_limit
    }

    fn logits<'c>(&self, context: &'c ScriptedContext) -> &'c [f32] {
        &context.logits
    }

    fn token_to_bytes(&self, _model: &ScriptedModel, token: TokenId) -> Result<Vec<u8>, BackendError> {
        VOCAB
            .get(token as usize)
            .map(|piece| piece.to_vec())
            .ok_or_else(|| BackendError::Detokenize(format!("unknown token {}", token)))
    }

    fn eos_token(&self, _model: &ScriptedModel) -> TokenId {
        EOS
    }

    fn vocab_size(&self, _model: &ScriptedModel) -> usize {
        VOCAB.len()
    }

    fn context_size(&self, context: &ScriptedContext) -> usize {
        context.context_size
    }

    fn free_context(&mut self, _context: ScriptedContext) {
        self.probe.live_contexts.fetch_sub(1, Ordering::SeqCst);
    }

    fn free_model(&mut self, model: ScriptedModel) {
        self.probe.live_models.fetch_sub(1, Ordering::SeqCst);
        self.probe.freed_models.lock().unwrap().push(model.path);
    }
}
