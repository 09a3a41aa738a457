//! Model lifecycle management
//!
//! Owns at most one model/context pair. Loading replaces the current model
//! (free first, then load), and a failed load always leaves the manager
//! unloaded.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::inference::backend::InferenceBackend;
use crate::inference::engine::{GenerationEngine, GenerationParams};
use crate::inference::error::EngineError;
use crate::storage::session_log::SessionLog;
use crate::types::config::{ContextParams, ModelParams};
use crate::types::model::{ModelInfo, ModelStatus};

/// A resident model together with the context bound to it
pub struct LoadedModel<B: InferenceBackend> {
    pub(crate) model: B::Model,
    pub(crate) context: B::Context,
    pub(crate) info: ModelInfo,
}

/// Single owner of the backend and of the loaded model
pub struct ModelManager<B: InferenceBackend> {
    backend: B,
    backend_ready: bool,
    model_params: ModelParams,
    context_params: ContextParams,
    generation: GenerationParams,
    loaded: Option<LoadedModel<B>>,
    log: Arc<SessionLog>,
}

impl<B: InferenceBackend> ModelManager<B> {
    pub fn new(
        backend: B,
        model_params: ModelParams,
        context_params: ContextParams,
        mut generation: GenerationParams,
        log: Arc<SessionLog>,
    ) -> Self {
        // Every request generates at least one token
        generation.max_new_tokens = generation.max_new_tokens.max(1);
        Self {
            backend,
            backend_ready: false,
            model_params,
            context_params,
            generation,
            loaded: None,
            log,
        }
    }

    /// Loads the model at `path`, replacing any model already loaded
    ///
    /// # Returns
    /// * `Ok(ModelInfo)` - Metadata of the freshly loaded model
    /// * `Err(EngineError)` - Path empty, backend init, model or context failure;
    ///   the manager is unloaded afterwards
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<ModelInfo, EngineError> {
        let path = path.as_ref();

        if path.as_os_str().is_empty() {
            return Err(EngineError::EmptyPath);
        }

        // Free the old pair before anything else so two never coexist
        self.unload();

        self.ensure_backend()?;

        self.log.record(format!("Loading model from {}", path.display()));
        let model = self
            .backend
            .load_model(path, &self.model_params)
            .map_err(|e| {
                self.log.record(format!("ERROR: Failed to load model from {}: {}", path.display(), e));
                EngineError::from(e)
            })?;

        let context = match self.backend.create_context(&model, &self.context_params) {
            Ok(ctx) => ctx,
            Err(e) => {
                self.log.record(format!("ERROR: Failed to create context: {}", e));
                self.backend.free_model(model);
                return Err(EngineError::ContextCreate(e.to_string()));
            }
        };

        let info = ModelInfo {
            path: PathBuf::from(path),
            vocab_size: self.backend.vocab_size(&model),
            context_size: self.backend.context_size(&context),
        };

        tracing::info!(
            "Model loaded: {} ({} vocab, {} ctx)",
            info.path.display(),
            info.vocab_size,
            info.context_size
        );
        self.log.record(format!(
            "Model loaded successfully: vocab {} tokens, context {} tokens, {} threads",
            info.vocab_size, info.context_size, self.context_params.threads
        ));

        self.loaded = Some(LoadedModel {
            model,
            context,
            info: info.clone(),
        });
        Ok(info)
    }

    /// Frees the context and then the model; a no-op when nothing is loaded
    pub fn unload(&mut self) {
        if let Some(LoadedModel { model, context, info }) = self.loaded.take() {
            self.backend.free_context(context);
            self.backend.free_model(model);
            tracing::info!("Model unloaded: {}", info.path.display());
            self.log.record(format!("Model freed: {}", info.path.display()));
        }
    }

    pub fn status(&self) -> ModelStatus {
        match &self.loaded {
            Some(loaded) => ModelStatus::Loaded(loaded.info.clone()),
            None => ModelStatus::NotLoaded,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// Path of the loaded model, if any
    pub fn loaded_path(&self) -> Option<&Path> {
        self.loaded.as_ref().map(|l| l.info.path.as_path())
    }

    /// Generation engine bound to the loaded model
    pub fn engine(&mut self) -> Result<GenerationEngine<'_, B>, EngineError> {
        let loaded = self.loaded.as_mut().ok_or(EngineError::NoModelLoaded)?;
        Ok(GenerationEngine::new(
            &self.backend,
            loaded,
            self.generation.clone(),
            &self.log,
        ))
    }

    fn ensure_backend(&mut self) -> Result<(), EngineError> {
        if self.backend_ready {
            return Ok(());
        }
        self.log.record("Initializing inference backend");
        self.backend
            .init()
            .map_err(|e| EngineError::BackendInit(e.to_string()))?;
        self.backend_ready = true;
        Ok(())
    }
}

impl<B: InferenceBackend> Drop for ModelManager<B> {
    fn drop(&mut self) {
        self.unload();
    }
}
