//! Generation engine
//!
//! Runs one request against the loaded model: tokenize, prefill the whole
//! prompt in a single batch, then decode one token at a time with greedy
//! selection until end-of-sequence or the new-token bound.
//!
//! # Failure semantics
//!
//! Anything failing before the first generation step has decoded is an error
//! of the whole request. A backend failure after that point ends generation
//! early, and the text produced so far is still returned.

use crate::inference::backend::{InferenceBackend, TokenBatch, TokenId};
use crate::inference::error::EngineError;
use crate::inference::lifecycle::LoadedModel;
use crate::inference::streaming::Utf8PieceDecoder;
use crate::storage::session_log::SessionLog;

/// Generation parameters for inference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationParams {
    /// Maximum number of tokens to generate
    pub max_new_tokens: usize,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self { max_new_tokens: 128 }
    }
}

/// Why the generation loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndOfSequence,
    MaxTokens,
    /// A decode step failed after output had started; output is partial
    BackendError(String),
}

/// Outcome of one generation run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationSummary {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    /// Generated text only, without the prompt
    pub text: String,
    pub stop: StopReason,
}

/// Event passed to the per-token callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationEvent<'a> {
    /// Prefill and the first decode step succeeded
    Started { prompt_tokens: usize },
    /// A complete piece of generated text
    Token(&'a str),
}

/// Strict greedy selection
///
/// Scans ids in ascending order and keeps the first id whose score is
/// strictly greater than the best so far, so ties resolve to the lowest id.
/// Returns `None` only for an empty vector.
pub fn greedy_argmax(logits: &[f32]) -> Option<TokenId> {
    if logits.is_empty() {
        return None;
    }

    let mut best_token_id = 0usize;
    let mut best_score = f32::NEG_INFINITY;
    for (token_id, &score) in logits.iter().enumerate() {
        if score > best_score {
            best_score = score;
            best_token_id = token_id;
        }
    }
    Some(best_token_id as TokenId)
}

/// Transient per-request state
struct GenerationSession {
    prompt_tokens: usize,
    /// Token fed to the next decode step
    next_input: TokenId,
    /// Sequence position of the next decode step
    position: i32,
    generated_tokens: usize,
    decoder: Utf8PieceDecoder,
    text: String,
}

impl GenerationSession {
    fn new(prompt: &[TokenId]) -> Self {
        Self {
            prompt_tokens: prompt.len(),
            next_input: prompt.last().copied().unwrap_or_default(),
            position: prompt.len() as i32,
            generated_tokens: 0,
            decoder: Utf8PieceDecoder::new(),
            text: String::new(),
        }
    }

    fn advance(&mut self, token: TokenId) {
        self.next_input = token;
        self.position += 1;
        self.generated_tokens += 1;
    }
}

/// Runs requests against a loaded model; obtained from
/// [`ModelManager::engine`](crate::inference::lifecycle::ModelManager::engine)
pub struct GenerationEngine<'a, B: InferenceBackend> {
    backend: &'a B,
    loaded: &'a mut LoadedModel<B>,
    params: GenerationParams,
    log: &'a SessionLog,
}

impl<'a, B: InferenceBackend> GenerationEngine<'a, B> {
    pub(crate) fn new(
        backend: &'a B,
        loaded: &'a mut LoadedModel<B>,
        params: GenerationParams,
        log: &'a SessionLog,
    ) -> Self {
        Self {
            backend,
            loaded,
            params,
            log,
        }
    }

    /// Blocking mode: returns the prompt followed by all generated text
    pub fn complete(&mut self, prompt: &str) -> Result<String, EngineError> {
        let summary = self.run(prompt, |_| {})?;
        let mut result = String::with_capacity(prompt.len() + summary.text.len());
        result.push_str(prompt);
        result.push_str(&summary.text);
        self.log
            .record(format!("Final response length: {} characters", result.len()));
        Ok(result)
    }

    /// Runs the generation, reporting progress through `on_event`
    pub fn run<F>(&mut self, prompt: &str, mut on_event: F) -> Result<GenerationSummary, EngineError>
    where
        F: FnMut(GenerationEvent<'_>),
    {
        if prompt.is_empty() {
            return Err(EngineError::EmptyPrompt);
        }

        let backend = self.backend;
        let LoadedModel {
            model,
            context,
            info,
        } = &mut *self.loaded;

        self.log
            .record(format!("Prompt length: {} characters", prompt.len()));

        // Every request starts from an empty sequence
        backend.reset_context(context);

        let tokens = backend.tokenize(model, prompt, true).map_err(|e| {
            self.log.record(format!("ERROR: Failed to tokenize prompt: {}", e));
            EngineError::Tokenization(e.to_string())
        })?;
        if tokens.is_empty() {
            self.log.record("ERROR: Empty prompt after tokenization");
            return Err(EngineError::Tokenization(
                "prompt produced no tokens".to_string(),
            ));
        }
        if tokens.len() >= info.context_size {
            self.log.record("ERROR: Prompt does not fit the context window");
            return Err(EngineError::Tokenization(format!(
                "prompt is {} tokens, context window is {}",
                tokens.len(),
                info.context_size
            )));
        }
        let max_batch = backend.max_batch_tokens(context);
        if tokens.len() > max_batch {
            self.log.record("ERROR: Prompt exceeds the decode batch limit");
            return Err(EngineError::Tokenization(format!(
                "prompt is {} tokens, a decode call takes at most {}",
                tokens.len(),
                max_batch
            )));
        }
        tracing::debug!("Tokenized prompt into {} tokens", tokens.len());
        self.log
            .record(format!("Tokenized prompt into {} tokens", tokens.len()));

        // Prefill
        backend
            .decode(context, &TokenBatch::prompt(&tokens))
            .map_err(|e| {
                self.log.record(format!("ERROR: Failed to decode prompt: {}", e));
                EngineError::Decode(e.to_string())
            })?;
        self.log
            .record("Prompt processing complete - generating response");

        let eos = backend.eos_token(model);
        let max_new_tokens = self.params.max_new_tokens;
        let mut session = GenerationSession::new(&tokens);
        let mut stop = StopReason::MaxTokens;

        for step in 0..max_new_tokens {
            let batch = TokenBatch::single(session.next_input, session.position);
            if let Err(e) = backend.decode(context, &batch) {
                self.log
                    .record(format!("ERROR: Failed to decode token {}: {}", step, e));
                if step == 0 {
                    return Err(EngineError::Decode(e.to_string()));
                }
                tracing::warn!("Decode failed after {} tokens, returning partial output", step);
                stop = StopReason::BackendError(e.to_string());
                break;
            }

            if step == 0 {
                on_event(GenerationEvent::Started {
                    prompt_tokens: session.prompt_tokens,
                });
            }

            let Some(next) = greedy_argmax(backend.logits(context)) else {
                if step == 0 {
                    return Err(EngineError::Decode("backend returned no logits".to_string()));
                }
                stop = StopReason::BackendError("backend returned no logits".to_string());
                break;
            };

            if next == eos {
                tracing::debug!("End of generation token encountered");
                self.log.record("Generated EOS token, stopping generation");
                stop = StopReason::EndOfSequence;
                break;
            }

            let bytes = match backend.token_to_bytes(model, next) {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.log
                        .record(format!("ERROR: Failed to convert token {}: {}", next, e));
                    stop = StopReason::BackendError(e.to_string());
                    break;
                }
            };

            session.advance(next);

            if let Some(piece) = session.decoder.push(&bytes) {
                on_event(GenerationEvent::Token(&piece));
                session.text.push_str(&piece);
            }

            if step % 5 == 0 || step + 1 == max_new_tokens {
                self.log.record(format!(
                    "Generated token {}/{}",
                    session.generated_tokens, max_new_tokens
                ));
            }
        }

        if let Some(piece) = session.decoder.finish() {
            on_event(GenerationEvent::Token(&piece));
            session.text.push_str(&piece);
        }

        self.log.record(format!(
            "Response generation complete: {} tokens ({:?})",
            session.generated_tokens, stop
        ));

        Ok(GenerationSummary {
            prompt_tokens: session.prompt_tokens,
            generated_tokens: session.generated_tokens,
            text: session.text,
            stop,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::lifecycle::ModelManager;
    use crate::inference::mock::{self, ScriptedBackend};
    use crate::types::config::{ContextParams, ModelParams};
    use std::sync::Arc;

    fn loaded(backend: ScriptedBackend, max_new_tokens: usize) -> ModelManager<ScriptedBackend> {
        let mut mgr = ModelManager::new(
            backend,
            ModelParams::default(),
            ContextParams::default(),
            GenerationParams { max_new_tokens },
            Arc::new(SessionLog::disabled()),
        );
        mgr.load("/models/test.bin").unwrap();
        mgr
    }

    #[test]
    fn test_greedy_argmax() {
        assert_eq!(greedy_argmax(&[0.1, 0.9, 0.3]), Some(1));
        assert_eq!(greedy_argmax(&[]), None);
    }

    #[test]
    fn test_greedy_ties_go_to_lowest_id() {
        assert_eq!(greedy_argmax(&[0.5, 2.0, 2.0, 1.0]), Some(1));
        assert_eq!(greedy_argmax(&[3.0, 3.0]), Some(0));
    }

    #[test]
    fn test_greedy_all_negative_infinity_picks_zero() {
        assert_eq!(greedy_argmax(&[f32::NEG_INFINITY, f32::NEG_INFINITY]), Some(0));
    }

    #[test]
    fn test_complete_returns_prompt_and_generation() {
        let script = vec![mock::FROM, mock::THE, mock::BRIDGE, mock::EOS];
        let mut mgr = loaded(ScriptedBackend::new(script), 16);

        let out = mgr.engine().unwrap().complete("hello world").unwrap();
        assert_eq!(out, "hello world from the bridge");
    }

    #[test]
    fn test_stops_at_end_of_sequence() {
        let script = vec![mock::FROM, mock::EOS, mock::THE];
        let mut mgr = loaded(ScriptedBackend::new(script), 16);

        let summary = mgr.engine().unwrap().run("hello", |_| {}).unwrap();
        assert_eq!(summary.generated_tokens, 1);
        assert_eq!(summary.text, " from");
        assert_eq!(summary.stop, StopReason::EndOfSequence);
    }

    #[test]
    fn test_respects_max_new_tokens() {
        let script = vec![mock::FROM; 10];
        let mut mgr = loaded(ScriptedBackend::new(script), 3);

        let mut tokens = 0;
        let summary = mgr
            .engine()
            .unwrap()
            .run("hello", |event| {
                if let GenerationEvent::Token(_) = event {
                    tokens += 1;
                }
            })
            .unwrap();
        assert_eq!(tokens, 3);
        assert_eq!(summary.generated_tokens, 3);
        assert_eq!(summary.stop, StopReason::MaxTokens);
    }

    #[test]
    fn test_identical_requests_are_deterministic() {
        let script = vec![mock::FROM, mock::THE, mock::BRIDGE, mock::BANG, mock::EOS];
        let mut mgr = loaded(ScriptedBackend::new(script), 16);

        let first = mgr.engine().unwrap().complete("hello world").unwrap();
        let second = mgr.engine().unwrap().complete("hello world").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_streamed_pieces_match_blocking_suffix() {
        let script = vec![mock::FROM, mock::E_ACUTE_HEAD, mock::E_ACUTE_TAIL, mock::BRIDGE, mock::EOS];
        let mut mgr = loaded(ScriptedBackend::new(script), 16);

        let blocking = mgr.engine().unwrap().complete("hello").unwrap();

        let mut streamed = String::new();
        let mut started = 0;
        mgr.engine()
            .unwrap()
            .run("hello", |event| match event {
                GenerationEvent::Started { .. } => started += 1,
                GenerationEvent::Token(piece) => streamed.push_str(piece),
            })
            .unwrap();

        assert_eq!(started, 1);
        assert_eq!(blocking.strip_prefix("hello"), Some(streamed.as_str()));
        assert_eq!(streamed, " fromé bridge");
    }

    #[test]
    fn test_positions_follow_prompt() {
        let script = vec![mock::FROM, mock::THE, mock::EOS];
        let backend = ScriptedBackend::new(script);
        let probe = backend.probe();
        let mut mgr = loaded(backend, 16);

        mgr.engine().unwrap().complete("hello world").unwrap();
        // BOS + 2 words prefilled at 0..=2, then single-token steps at 3, 4, 5
        assert_eq!(probe.decoded_positions(), vec![vec![0, 1, 2], vec![3], vec![4], vec![5]]);
    }

    #[test]
    fn test_tokenize_failure() {
        let mut mgr = loaded(ScriptedBackend::new(vec![]).failing_tokenize(), 16);
        let err = mgr.engine().unwrap().complete("hello").unwrap_err();
        assert!(matches!(err, EngineError::Tokenization(_)));
    }

    #[test]
    fn test_zero_tokens_is_an_error() {
        let mut mgr = loaded(ScriptedBackend::new(vec![]), 16);
        let err = mgr.engine().unwrap().complete("   ").unwrap_err();
        assert!(matches!(err, EngineError::Tokenization(_)));
    }

    #[test]
    fn test_oversized_prompt_rejected() {
        let backend = ScriptedBackend::new(vec![mock::EOS]);
        let mut mgr = ModelManager::new(
            backend,
            ModelParams::default(),
            ContextParams {
                context_size: 3,
                ..ContextParams::default()
            },
            GenerationParams::default(),
            Arc::new(SessionLog::disabled()),
        );
        mgr.load("/models/test.bin").unwrap();

        let err = mgr.engine().unwrap().complete("hello world").unwrap_err();
        assert!(matches!(err, EngineError::Tokenization(_)));
    }

    #[test]
    fn test_long_prompt_prefills_in_one_call() {
        let backend = ScriptedBackend::new(vec![mock::FROM, mock::EOS]);
        let probe = backend.probe();
        let mut mgr = ModelManager::new(
            backend,
            ModelParams::default(),
            ContextParams {
                batch_size: 4,
                ..ContextParams::default()
            },
            GenerationParams::default(),
            Arc::new(SessionLog::disabled()),
        );
        mgr.load("/models/test.bin").unwrap();

        let prompt = vec!["hello"; 600].join(" ");
        let out = mgr.engine().unwrap().complete(&prompt).unwrap();
        assert_eq!(out, format!("{} from", prompt));
        // BOS + 600 words in a single prefill batch
        assert_eq!(probe.decoded_positions()[0].len(), 601);
    }

    #[test]
    fn test_prompt_over_batch_limit_never_reaches_decode() {
        let backend = ScriptedBackend::new(vec![mock::FROM]).with_batch_limit(2);
        let probe = backend.probe();
        let mut mgr = loaded(backend, 16);

        let err = mgr.engine().unwrap().complete("hello world").unwrap_err();
        assert!(matches!(err, EngineError::Tokenization(_)));
        // Only the tokenize call went to the backend
        assert_eq!(probe.inference_calls(), 1);
        assert!(probe.decoded_positions().is_empty());
    }

    #[test]
    fn test_zero_token_budget_still_generates_one() {
        let mut mgr = loaded(ScriptedBackend::new(vec![mock::FROM, mock::THE]), 0);

        let mut started = 0;
        let summary = mgr
            .engine()
            .unwrap()
            .run("hello", |event| {
                if let GenerationEvent::Started { .. } = event {
                    started += 1;
                }
            })
            .unwrap();
        assert_eq!(started, 1);
        assert_eq!(summary.generated_tokens, 1);
        assert_eq!(summary.stop, StopReason::MaxTokens);
    }

    #[test]
    fn test_prefill_failure_aborts_before_events() {
        let backend = ScriptedBackend::new(vec![mock::FROM]).failing_decode_at(0);
        let mut mgr = loaded(backend, 16);

        let mut events = 0;
        let err = mgr.engine().unwrap().run("hello", |_| events += 1).unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));
        assert_eq!(events, 0);
    }

    #[test]
    fn test_first_step_failure_is_an_error() {
        let backend = ScriptedBackend::new(vec![mock::FROM]).failing_decode_at(1);
        let mut mgr = loaded(backend, 16);

        let mut events = 0;
        let err = mgr.engine().unwrap().run("hello", |_| events += 1).unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));
        assert_eq!(events, 0);
    }

    #[test]
    fn test_mid_generation_failure_keeps_partial_output() {
        let script = vec![mock::FROM, mock::THE, mock::BRIDGE, mock::EOS];
        // Decode calls: 0 = prefill, 1 = first step, 2 = second step, 3 = third step
        let backend = ScriptedBackend::new(script).failing_decode_at(3);
        let mut mgr = loaded(backend, 16);

        let summary = mgr.engine().unwrap().run("hello", |_| {}).unwrap();
        assert_eq!(summary.text, " from the");
        assert!(matches!(summary.stop, StopReason::BackendError(_)));

        let out = mgr.engine().unwrap().complete("hello").unwrap();
        assert_eq!(out, "hello from the");
    }

    #[test]
    fn test_empty_prompt_rejected() {
        let backend = ScriptedBackend::new(vec![]);
        let probe = backend.probe();
        let mut mgr = loaded(backend, 16);

        let err = mgr.engine().unwrap().complete("").unwrap_err();
        assert_eq!(err, EngineError::EmptyPrompt);
        assert_eq!(probe.inference_calls(), 0);
    }
}
