//! artforge_runtime_llm - Candle-based chat-model runtime
//!
//! Owns the single loaded-model slot for the LLM handler: quantization-aware
//! weight resolution, config preparation, VRAM-friendly loading, and the
//! streaming generation orchestrator.

pub mod model;
pub mod orchestrator;
pub mod prepare;
pub mod sampling;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use artforge_core::error::ModelLoadError;
use artforge_core::events::{EngineEvent, ModelKind, ModelStatus, SignalBus};
use artforge_core::weights::{self, ModelFamily};
use artforge_runtime_api::{Runtime, RuntimeCaps, RuntimeLoadConfig};

pub use model::{LoadedModel, StreamFinish, StreamOutcome};
pub use orchestrator::{GenerationOrchestrator, TokenCallback, TokenStreamer};
pub use sampling::SamplingParams;

/// Context policy handed in by the engine config.
#[derive(Debug, Clone, Copy)]
pub struct ContextPolicy {
    pub target_context_len: usize,
    pub allow_rope_scaling: bool,
}

impl Default for ContextPolicy {
    fn default() -> Self {
        Self {
            target_context_len: 8192,
            allow_rope_scaling: false,
        }
    }
}

pub struct LlmRuntime {
    status: ModelStatus,
    model: Option<Arc<LoadedModel>>,
    context: ContextPolicy,
    bus: SignalBus,
}

impl LlmRuntime {
    pub fn new(context: ContextPolicy, bus: SignalBus) -> Self {
        Self {
            status: ModelStatus::Unloaded,
            model: None,
            context,
            bus,
        }
    }

    pub fn model(&self) -> Option<Arc<LoadedModel>> {
        self.model.clone()
    }

    fn transition(&mut self, status: ModelStatus) {
        self.status = status;
        self.bus.emit(EngineEvent::ModelStatusChanged {
            kind: ModelKind::Llm,
            status,
        });
    }

    fn device() -> Result<candle_core::Device, ModelLoadError> {
        #[cfg(feature = "metal")]
        {
            tracing::info!("Using Metal device");
            candle_core::Device::new_metal(0).map_err(|e| ModelLoadError::Device(e.to_string()))
        }
        #[cfg(feature = "cuda")]
        {
            tracing::info!("Using CUDA device");
            candle_core::Device::new_cuda(0).map_err(|e| ModelLoadError::Device(e.to_string()))
        }
        #[cfg(not(any(feature = "metal", feature = "cuda")))]
        {
            tracing::info!("Using CPU device (no GPU features enabled)");
            Ok(candle_core::Device::Cpu)
        }
    }

    /// Synchronous load for callers that already live on a worker thread.
    /// Same contract as [`Runtime::load`].
    pub fn load_sync(&mut self, config: RuntimeLoadConfig) -> Result<(), ModelLoadError> {
        if self.status == ModelStatus::Loaded
            && self.loaded_path().as_deref() == Some(config.model_path.as_path())
        {
            tracing::debug!("chat model already loaded");
            return Ok(());
        }
        if self.model.is_some() {
            self.unload_sync();
        }

        self.transition(ModelStatus::Loading);
        match Self::load_blocking(&config, self.context) {
            Ok(model) => {
                self.model = Some(Arc::new(model));
                self.transition(ModelStatus::Loaded);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "chat model load failed");
                self.transition(ModelStatus::Failed);
                Err(e)
            }
        }
    }

    /// Synchronous unload; safe on an empty slot.
    pub fn unload_sync(&mut self) {
        if self.model.take().is_some() {
            tracing::info!("unloading chat model");
            self.transition(ModelStatus::Unloaded);
        } else if self.status != ModelStatus::Unloaded {
            self.transition(ModelStatus::Unloaded);
        }
    }

    /// The blocking part of a load, run off the async executor.
    fn load_blocking(
        config: &RuntimeLoadConfig,
        context: ContextPolicy,
    ) -> Result<LoadedModel, ModelLoadError> {
        let model_dir = &config.model_path;

        // Known-quirk patching first so validation sees a parseable config.
        // An unpatchable file is advisory: the load proceeds and any real
        // problem surfaces as a load error.
        match prepare::patch_known_config_quirks(model_dir) {
            Ok(true) => tracing::info!(path = %model_dir.display(), "patched model config quirks"),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "config patch skipped"),
        }

        let mut model_config = prepare::validate_chat_model(model_dir)?;

        let plan = weights::resolve(model_dir, config.dtype, ModelFamily::Transformer)
            .map_err(|e| ModelLoadError::Weights {
                path: model_dir.clone(),
                reason: e.to_string(),
            })?;

        // Cache hits carry their own (already-patched, already-scaled)
        // config; re-read it from the cache directory.
        if plan.from_cache {
            model_config = prepare::read_config(&plan.weights_path)?;
        }

        if let Some(rope) = prepare::plan_rope_scaling(
            &model_config,
            context.target_context_len,
            context.allow_rope_scaling,
        ) {
            tracing::info!(factor = rope.factor, "extending context via rope scaling");
            prepare::apply_rope_scaling(&mut model_config, &rope);
        }
        let context_len = prepare::resolved_context_len(
            &model_config,
            context.target_context_len,
            context.allow_rope_scaling,
        );

        let device = Self::device()?;
        let model = LoadedModel::load(&plan, &model_config, context_len, &device)?;

        // Adapters come last and fail independently of the base load.
        for adapter in &config.adapters {
            tracing::warn!(
                adapter = %adapter.display(),
                "adapter loading is not supported by the candle chat backend; skipping"
            );
        }

        Ok(model)
    }
}

#[async_trait]
impl Runtime for LlmRuntime {
    fn caps(&self) -> RuntimeCaps {
        RuntimeCaps {
            chat: true,
            images: false,
            embeddings: false,
            streaming: true,
            tool_calls: true,
        }
    }

    fn status(&self) -> ModelStatus {
        self.status
    }

    fn loaded_path(&self) -> Option<PathBuf> {
        self.model.as_ref().map(|m| m.model_path().to_path_buf())
    }

    async fn load(&mut self, config: RuntimeLoadConfig) -> Result<(), ModelLoadError> {
        if self.status == ModelStatus::Loaded
            && self.loaded_path().as_deref() == Some(config.model_path.as_path())
        {
            tracing::debug!("chat model already loaded");
            return Ok(());
        }
        if self.model.is_some() {
            self.unload().await;
        }

        self.transition(ModelStatus::Loading);

        let context = self.context;
        let result = tokio::task::spawn_blocking(move || Self::load_blocking(&config, context))
            .await
            .map_err(|e| ModelLoadError::Device(format!("load task panicked: {e}")));

        match result.and_then(|r| r) {
            Ok(model) => {
                self.model = Some(Arc::new(model));
                self.transition(ModelStatus::Loaded);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "chat model load failed");
                self.transition(ModelStatus::Failed);
                Err(e)
            }
        }
    }

    async fn unload(&mut self) {
        self.unload_sync();
    }
}
