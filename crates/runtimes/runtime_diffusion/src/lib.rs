//! artforge_runtime_diffusion - Diffusion request assembly and generation
//!
//! This crate turns a settings snapshot into the keyword-argument bundle a
//! diffusion pipeline call needs, and owns the VRAM-tiered pipeline
//! lifecycle. A candle-backed Stable-Diffusion-family pipeline ships as the
//! default backend.

pub mod lifecycle;
pub mod pipeline;
pub mod request;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use artforge_core::error::{GenerationError, ModelLoadError, UnsupportedOperationError};

pub use lifecycle::{plan_memory_optimizations, MemoryPlan, PipelineSlot, VramProbe};
pub use request::{BuildOverrides, RequestBuilder, RequestBundle};

/// An image input to a generation call. `Canvas` is a placeholder the host
/// resolves to concrete bytes before the request is built; a pipeline seeing
/// it is a bug surfaced as [`GenerationError::UnresolvedCanvasImage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ImageInput {
    Canvas,
    Path { path: PathBuf },
    Base64 { data: String },
}

/// Opaque reference to a precomputed tensor (prompt embeddings, latents)
/// living in the host's tensor store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TensorRef(pub String);

/// Scheduler families the pipelines know how to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    Ddim,
    Euler,
    EulerAncestral,
    Lms,
    DpmPlusPlus2m,
    Pndm,
    UniPc,
    Heun,
}

impl SchedulerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerKind::Ddim => "ddim",
            SchedulerKind::Euler => "euler",
            SchedulerKind::EulerAncestral => "euler_ancestral",
            SchedulerKind::Lms => "lms",
            SchedulerKind::DpmPlusPlus2m => "dpmpp_2m",
            SchedulerKind::Pndm => "pndm",
            SchedulerKind::UniPc => "unipc",
            SchedulerKind::Heun => "heun",
        }
    }
}

impl FromStr for SchedulerKind {
    type Err = UnsupportedOperationError;

    /// User-facing scheduler names, as the settings UI spells them. A typo
    /// fails here, before any denoise run starts.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "ddim" => Ok(SchedulerKind::Ddim),
            "euler" => Ok(SchedulerKind::Euler),
            "euler_a" | "euler_ancestral" => Ok(SchedulerKind::EulerAncestral),
            "lms" => Ok(SchedulerKind::Lms),
            "dpm++_2m" | "dpmpp_2m" | "dpm_solver" => Ok(SchedulerKind::DpmPlusPlus2m),
            "pndm" => Ok(SchedulerKind::Pndm),
            "unipc" => Ok(SchedulerKind::UniPc),
            "heun" => Ok(SchedulerKind::Heun),
            _ => Err(UnsupportedOperationError::UnknownScheduler {
                scheduler: s.to_string(),
            }),
        }
    }
}

/// Raw RGB output of a pipeline call.
pub struct GeneratedImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Which memory optimizations a pipeline implementation actually supports.
/// The lifecycle manager intersects its tier plan with these instead of
/// probing methods reflectively.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PipelineCaps {
    pub attention_slicing: bool,
    pub vae_slicing: bool,
    pub vae_tiling: bool,
    pub model_cpu_offload: bool,
    pub sequential_cpu_offload: bool,
    pub lora_adapters: bool,
}

/// A loaded diffusion pipeline. One instance per slot; forward passes are
/// not safe to run concurrently on shared weights, which the single-worker
/// queue upstream guarantees.
pub trait DiffusionPipeline: Send {
    fn caps(&self) -> PipelineCaps;

    /// Directory the pipeline was loaded from, for the path-mismatch guard.
    fn model_path(&self) -> &Path;

    fn enable_attention_slicing(&mut self) {}
    fn enable_vae_slicing(&mut self) {}
    fn enable_vae_tiling(&mut self) {}

    /// Adapter (LoRA-style) load, applied after the base load.
    fn load_adapter(&mut self, path: &Path) -> Result<(), ModelLoadError> {
        Err(ModelLoadError::Adapter {
            path: path.to_path_buf(),
            reason: "adapters not supported by this pipeline".to_string(),
        })
    }

    fn generate(&mut self, bundle: &RequestBundle) -> Result<GeneratedImage, GenerationError>;
}

/// Builds a pipeline from a resolved load plan. The memory plan is known
/// before load so offload decisions can shape device placement.
pub trait PipelineLoader: Send + Sync {
    fn load(
        &self,
        plan: &artforge_core::weights::LoadPlan,
        memory: &MemoryPlan,
    ) -> Result<Box<dyn DiffusionPipeline>, ModelLoadError>;
}

pub(crate) fn default_device() -> Result<candle_core::Device, ModelLoadError> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_names_parse_loosely() {
        assert_eq!("DDIM".parse::<SchedulerKind>().unwrap(), SchedulerKind::Ddim);
        assert_eq!(
            "Euler A".parse::<SchedulerKind>().unwrap(),
            SchedulerKind::EulerAncestral
        );
        assert_eq!(
            "DPM++ 2M".parse::<SchedulerKind>().unwrap(),
            SchedulerKind::DpmPlusPlus2m
        );
        assert!(matches!(
            "warp_drive".parse::<SchedulerKind>(),
            Err(UnsupportedOperationError::UnknownScheduler { .. })
        ));
    }
}
