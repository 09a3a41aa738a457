//! Inference service
//!
//! The one shared handle on the model. Every load, unload and generation runs
//! on a blocking worker thread while holding a single process-wide lock, so
//! no two of them can ever overlap, and the lock is released on every exit
//! path when the guard drops.
//!
//! Besides the calls used by the socket server, this module exposes the
//! embedding-facing API: submit a (model path, prompt) pair and get the
//! result back through a future or a callback, without blocking the caller.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::inference::backend::InferenceBackend;
use crate::inference::engine::{GenerationEvent, GenerationParams};
use crate::inference::error::EngineError;
use crate::inference::lifecycle::ModelManager;
use crate::inference::streaming::StreamToken;
use crate::storage::session_log::SessionLog;
use crate::storage::settings::BridgeSettings;
use crate::types::config::{ContextParams, ModelParams};
use crate::types::model::{ModelInfo, ModelStatus};

/// Shared, lock-guarded owner of the model lifecycle
pub struct InferenceService<B: InferenceBackend> {
    manager: Arc<Mutex<ModelManager<B>>>,
    log: Arc<SessionLog>,
}

impl<B: InferenceBackend> Clone for InferenceService<B> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            log: self.log.clone(),
        }
    }
}

impl<B: InferenceBackend> InferenceService<B> {
    /// Builds a service whose parameters come from the bridge settings
    pub fn new(backend: B, settings: &BridgeSettings, log: Arc<SessionLog>) -> Self {
        Self::with_params(
            backend,
            settings.model_params(),
            settings.context_params(),
            GenerationParams {
                max_new_tokens: settings.max_new_tokens as usize,
            },
            log,
        )
    }

    pub fn with_params(
        backend: B,
        model_params: ModelParams,
        context_params: ContextParams,
        generation: GenerationParams,
        log: Arc<SessionLog>,
    ) -> Self {
        let manager = ModelManager::new(backend, model_params, context_params, generation, log.clone());
        Self {
            manager: Arc::new(Mutex::new(manager)),
            log,
        }
    }

    /// Runs `f` on a blocking thread with exclusive access to the manager
    async fn with_manager<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&mut ModelManager<B>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = manager.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await
        .map_err(|e| EngineError::WorkerError(e.to_string()))
    }

    /// Loads a model, replacing the current one
    pub async fn load(&self, path: impl Into<PathBuf>) -> Result<ModelInfo, EngineError> {
        let path = path.into();
        self.with_manager(move |mgr| mgr.load(&path)).await?
    }

    /// Frees the loaded model, if any
    pub async fn unload(&self) {
        if let Err(e) = self.with_manager(|mgr| mgr.unload()).await {
            tracing::error!("Unload task failed: {}", e);
        }
    }

    pub async fn status(&self) -> ModelStatus {
        self.with_manager(|mgr| mgr.status())
            .await
            .unwrap_or(ModelStatus::NotLoaded)
    }

    /// Blocking-mode generation: prompt followed by generated text
    pub async fn infer(&self, prompt: impl Into<String>) -> Result<String, EngineError> {
        let prompt = prompt.into();
        self.with_manager(move |mgr| {
            if prompt.is_empty() {
                return Err(EngineError::EmptyPrompt);
            }
            mgr.engine()?.complete(&prompt)
        })
        .await?
    }

    /// Streaming-mode generation
    ///
    /// The receiver yields `Started`, then one `Token` per decoded piece, then
    /// `Done`; or a single `Error` if generation never started. Dropping the
    /// receiver does not cancel the generation, which runs to its own stop.
    pub fn infer_stream(&self, prompt: impl Into<String>) -> mpsc::UnboundedReceiver<StreamToken> {
        let prompt = prompt.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = self.manager.clone();

        tokio::task::spawn_blocking(move || {
            let mut guard = manager.lock().unwrap_or_else(PoisonError::into_inner);
            let result = if prompt.is_empty() {
                Err(EngineError::EmptyPrompt)
            } else {
                guard.engine().and_then(|mut engine| {
                    engine.run(&prompt, |event| {
                        let message = match event {
                            GenerationEvent::Started { prompt_tokens } => {
                                StreamToken::Started { prompt_tokens }
                            }
                            GenerationEvent::Token(piece) => StreamToken::Token(piece.to_string()),
                        };
                        // Receiver gone: keep generating, nobody is listening
                        let _ = tx.send(message);
                    })
                })
            };

            let _ = match result {
                Ok(summary) => tx.send(StreamToken::Done(summary)),
                Err(e) => tx.send(StreamToken::Error(e.to_string())),
            };
        });

        rx
    }

    /// Embedding entry point: ensures `model_path` is loaded, then runs a
    /// blocking-mode generation on a background thread
    pub async fn process_prompt(
        &self,
        model_path: impl Into<PathBuf>,
        prompt: impl Into<String>,
    ) -> Result<String, EngineError> {
        self.submit(model_path, prompt).await
    }

    /// Starts [`process_prompt`](Self::process_prompt) in the background and
    /// returns a handle resolving exactly once
    pub fn submit(&self, model_path: impl Into<PathBuf>, prompt: impl Into<String>) -> PendingCompletion {
        let model_path = model_path.into();
        let prompt = prompt.into();
        let (tx, rx) = oneshot::channel();
        let manager = self.manager.clone();
        let log = self.log.clone();

        log.record(format!("Prompt submitted for model {}", model_path.display()));
        tokio::task::spawn_blocking(move || {
            log.record("Worker thread started execution");
            let mut guard = manager.lock().unwrap_or_else(PoisonError::into_inner);
            let result = load_and_complete(&mut guard, &model_path, &prompt);
            drop(guard);

            match &result {
                Ok(text) => log.record(format!(
                    "Worker processing completed successfully ({} characters)",
                    text.len()
                )),
                Err(e) => log.record(format!("ERROR: {}", e)),
            }
            let _ = tx.send(result);
        });

        PendingCompletion { rx }
    }

    /// Callback flavor of [`submit`](Self::submit); the callback receives
    /// `(error, result)` with exactly one side set
    pub fn process_prompt_with<F>(
        &self,
        model_path: impl Into<PathBuf>,
        prompt: impl Into<String>,
        callback: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Option<String>, Option<String>) + Send + 'static,
    {
        let pending = self.submit(model_path, prompt);
        tokio::spawn(async move {
            match pending.await {
                Ok(text) => callback(None, Some(text)),
                Err(e) => callback(Some(e.to_string()), None),
            }
        })
    }

    /// Accumulated diagnostic log
    pub fn session_log(&self) -> String {
        self.log.contents()
    }

    pub fn log(&self) -> &Arc<SessionLog> {
        &self.log
    }
}

fn load_and_complete<B: InferenceBackend>(
    mgr: &mut ModelManager<B>,
    model_path: &Path,
    prompt: &str,
) -> Result<String, EngineError> {
    if prompt.is_empty() {
        return Err(EngineError::EmptyPrompt);
    }
    if mgr.loaded_path() != Some(model_path) {
        mgr.load(model_path)?;
    }
    mgr.engine()?.complete(prompt)
}

/// Result of a submitted prompt, resolved exactly once
pub struct PendingCompletion {
    rx: oneshot::Receiver<Result<String, EngineError>>,
}

impl PendingCompletion {
    /// Non-blocking check; `None` while the generation is still running
    pub fn try_result(&mut self) -> Option<Result<String, EngineError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(EngineError::WorkerError(
                "worker dropped without a result".to_string(),
            ))),
        }
    }
}

impl Future for PendingCompletion {
    type Output = Result<String, EngineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|e| Err(EngineError::WorkerError(e.to_string()))))
    }
}
