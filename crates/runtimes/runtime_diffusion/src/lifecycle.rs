//! Pipeline lifecycle: the single loaded-pipeline slot, VRAM-tiered memory
//! optimization, and status transitions.
//!
//! State machine: `Unloaded --load--> Loading --> Loaded | Failed`,
//! `Loaded --unload--> Unloaded`, and a transparent unload+reload when the
//! configured model path no longer matches the loaded one. Load failures
//! never propagate past this boundary; they are logged with their full chain
//! and reported through status events.

use std::path::Path;

use artforge_core::config::VramPolicy;
use artforge_core::error::GenerationError;
use artforge_core::events::{EngineEvent, ModelKind, ModelStatus, SignalBus};
use artforge_core::models::ModelIdentity;
use artforge_core::settings::MemorySettings;
use artforge_core::weights::{self, ModelFamily, QuantDtype};

use crate::{DiffusionPipeline, GeneratedImage, PipelineLoader, RequestBundle};

/// Detected accelerator memory. Implementations query the device; tests pin
/// a value.
pub trait VramProbe: Send + Sync {
    /// Total VRAM in GB, `None` when no accelerator is present or the query
    /// failed.
    fn total_vram_gb(&self) -> Option<f64>;
}

/// Probe with a fixed answer.
pub struct StaticVramProbe(pub Option<f64>);

impl VramProbe for StaticVramProbe {
    fn total_vram_gb(&self) -> Option<f64> {
        self.0
    }
}

/// What will be applied to the pipeline, before capability intersection.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MemoryPlan {
    pub attention_slicing: bool,
    pub vae_slicing: bool,
    pub vae_tiling: bool,
    pub model_cpu_offload: bool,
    pub sequential_cpu_offload: bool,
    pub channels_last: bool,
    pub tf32: bool,
}

/// Tier the optimizations by detected VRAM.
///
/// At or above `full_residency_gb` the model stays resident; below it
/// model-level CPU offload turns on; below `sequential_offload_below_gb`
/// sequential offload joins it. Slicing is always planned (a free win where
/// supported). Advisory flags can only add offload, never remove what the
/// tier demands. Unknown VRAM is treated as the smallest tier.
pub fn plan_memory_optimizations(
    vram_gb: Option<f64>,
    policy: &VramPolicy,
    advisory: &MemorySettings,
) -> MemoryPlan {
    let (tier_model_offload, tier_sequential_offload) = match vram_gb {
        Some(gb) if gb >= policy.full_residency_gb => (false, false),
        Some(gb) if gb >= policy.sequential_offload_below_gb => (true, false),
        _ => (true, true),
    };

    MemoryPlan {
        attention_slicing: true,
        vae_slicing: true,
        vae_tiling: advisory.vae_tiling,
        model_cpu_offload: tier_model_offload || advisory.model_cpu_offload,
        sequential_cpu_offload: tier_sequential_offload || advisory.sequential_cpu_offload,
        channels_last: advisory.channels_last,
        tf32: advisory.tf32,
    }
}

/// The single loaded-pipeline slot for the diffusion handler.
pub struct PipelineSlot {
    status: ModelStatus,
    pipeline: Option<Box<dyn DiffusionPipeline>>,
    loader: Box<dyn PipelineLoader>,
    vram: Box<dyn VramProbe>,
    policy: VramPolicy,
    bus: SignalBus,
}

impl PipelineSlot {
    pub fn new(
        loader: Box<dyn PipelineLoader>,
        vram: Box<dyn VramProbe>,
        policy: VramPolicy,
        bus: SignalBus,
    ) -> Self {
        Self {
            status: ModelStatus::Unloaded,
            pipeline: None,
            loader,
            vram,
            policy,
            bus,
        }
    }

    pub fn status(&self) -> ModelStatus {
        self.status
    }

    pub fn loaded_path(&self) -> Option<&Path> {
        self.pipeline.as_ref().map(|p| p.model_path())
    }

    fn transition(&mut self, status: ModelStatus) {
        self.status = status;
        self.bus.emit(EngineEvent::ModelStatusChanged {
            kind: ModelKind::Diffusion,
            status,
        });
    }

    /// Load the pipeline for `identity`. Idempotent: a slot already loaded
    /// with the same path is left untouched.
    pub fn load(
        &mut self,
        identity: &ModelIdentity,
        dtype: QuantDtype,
        advisory: &MemorySettings,
        adapters: &[std::path::PathBuf],
    ) -> ModelStatus {
        if self.status == ModelStatus::Loaded
            && self.loaded_path() == Some(identity.path.as_path())
        {
            tracing::debug!(model = %identity.name, "pipeline already loaded");
            return self.status;
        }
        if self.pipeline.is_some() {
            self.unload();
        }

        self.transition(ModelStatus::Loading);

        let plan = match weights::resolve(&identity.path, dtype, ModelFamily::Diffusers) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::error!(model = %identity.name, error = %e, "weight resolution failed");
                self.transition(ModelStatus::Failed);
                return self.status;
            }
        };

        let memory = plan_memory_optimizations(self.vram.total_vram_gb(), &self.policy, advisory);
        tracing::info!(
            model = %identity.name,
            from_cache = plan.from_cache,
            ?memory,
            "loading diffusion pipeline"
        );

        let mut pipeline = match self.loader.load(&plan, &memory) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                tracing::error!(model = %identity.name, error = %e, "pipeline load failed");
                self.transition(ModelStatus::Failed);
                return self.status;
            }
        };

        apply_memory_plan(pipeline.as_mut(), &memory);

        // Adapters come after the base load and fail independently.
        for adapter in adapters {
            if let Err(e) = pipeline.load_adapter(adapter) {
                tracing::warn!(adapter = %adapter.display(), error = %e, "adapter load failed");
            }
        }

        self.pipeline = Some(pipeline);
        self.transition(ModelStatus::Loaded);
        self.status
    }

    /// Release the pipeline and device memory. Safe on an unloaded slot.
    pub fn unload(&mut self) {
        if self.pipeline.take().is_some() {
            tracing::info!("unloading diffusion pipeline");
            self.transition(ModelStatus::Unloaded);
        } else if self.status != ModelStatus::Unloaded {
            // A failed slot holds no pipeline but still needs the reset.
            self.transition(ModelStatus::Unloaded);
        }
    }

    /// Make sure the slot holds the configured model before a generation:
    /// settings changes take effect here without the caller orchestrating a
    /// reload.
    pub fn ensure_loaded(
        &mut self,
        identity: &ModelIdentity,
        dtype: QuantDtype,
        advisory: &MemorySettings,
    ) -> ModelStatus {
        if self.status == ModelStatus::Loaded {
            if self.loaded_path() == Some(identity.path.as_path()) {
                return self.status;
            }
            tracing::info!(
                configured = %identity.path.display(),
                "configured model path changed, reloading"
            );
            self.unload();
        }
        self.load(identity, dtype, advisory, &[])
    }

    pub fn generate(&mut self, bundle: &RequestBundle) -> Result<GeneratedImage, GenerationError> {
        let pipeline = self.pipeline.as_mut().ok_or(GenerationError::NotLoaded)?;
        pipeline.generate(bundle)
    }
}

fn apply_memory_plan(pipeline: &mut dyn DiffusionPipeline, plan: &MemoryPlan) {
    let caps = pipeline.caps();
    if plan.attention_slicing && caps.attention_slicing {
        pipeline.enable_attention_slicing();
    }
    if plan.vae_slicing && caps.vae_slicing {
        pipeline.enable_vae_slicing();
    }
    if plan.vae_tiling && caps.vae_tiling {
        pipeline.enable_vae_tiling();
    }
}
