//! Immutable per-call settings snapshots.
//!
//! The host application owns a mutable settings store; the engine only ever
//! sees a [`SettingsSnapshot`] cloned out of it at the top of a call. Ratio
//! fields keep their stored-integer encoding here and are normalized through
//! [`crate::units`] at request-build time.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::UnsupportedOperationError;

/// Diffusion operation mode, persisted in the store as the `section` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    Txt2Img,
    Img2Img,
    Outpaint,
    Depth2Img,
    Pix2Pix,
    Upscale,
}

impl OperationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationMode::Txt2Img => "txt2img",
            OperationMode::Img2Img => "img2img",
            OperationMode::Outpaint => "outpaint",
            OperationMode::Depth2Img => "depth2img",
            OperationMode::Pix2Pix => "pix2pix",
            OperationMode::Upscale => "upscale",
        }
    }
}

impl FromStr for OperationMode {
    type Err = UnsupportedOperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "txt2img" => Ok(OperationMode::Txt2Img),
            "img2img" => Ok(OperationMode::Img2Img),
            // Inpainting and outpainting share a pipeline.
            "outpaint" | "inpaint" => Ok(OperationMode::Outpaint),
            "depth2img" => Ok(OperationMode::Depth2Img),
            "pix2pix" => Ok(OperationMode::Pix2Pix),
            "upscale" => Ok(OperationMode::Upscale),
            other => Err(UnsupportedOperationError::UnknownSection {
                section: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for OperationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-facing generation configuration. Ratio fields are stored-integer
/// encoded (see [`crate::units`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorSettings {
    #[serde(default)]
    pub prompt: String,

    #[serde(default)]
    pub negative_prompt: String,

    #[serde(default = "default_steps")]
    pub steps: u32,

    /// CFG scale, stored as value * 100.
    #[serde(default = "default_scale")]
    pub scale: i64,

    #[serde(default)]
    pub seed: u64,

    /// When set, the seed field is ignored and the pipeline draws its own.
    #[serde(default = "default_true")]
    pub random_seed: bool,

    /// Logical model name, resolved through the registry.
    #[serde(default)]
    pub model: String,

    #[serde(default = "default_scheduler")]
    pub scheduler: String,

    /// img2img blend strength, stored as value * 100.
    #[serde(default = "default_strength")]
    pub strength: i64,

    /// pix2pix image guidance, stored as value * 100.
    #[serde(default = "default_image_guidance_scale")]
    pub image_guidance_scale: i64,

    #[serde(default)]
    pub clip_skip: u32,

    #[serde(default = "default_n_samples")]
    pub n_samples: u32,

    /// Operation mode for the next generation call.
    #[serde(default = "default_section")]
    pub section: String,

    /// Precision to load diffusion weights at.
    #[serde(default = "default_gen_dtype")]
    pub dtype: crate::weights::QuantDtype,

    #[serde(default = "default_dimension")]
    pub width: u32,

    #[serde(default = "default_dimension")]
    pub height: u32,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            steps: default_steps(),
            scale: default_scale(),
            seed: 0,
            random_seed: true,
            model: String::new(),
            scheduler: default_scheduler(),
            strength: default_strength(),
            image_guidance_scale: default_image_guidance_scale(),
            clip_skip: 0,
            n_samples: default_n_samples(),
            section: default_section(),
            dtype: default_gen_dtype(),
            width: default_dimension(),
            height: default_dimension(),
        }
    }
}

fn default_gen_dtype() -> crate::weights::QuantDtype {
    crate::weights::QuantDtype::Full
}

fn default_steps() -> u32 {
    20
}

fn default_scale() -> i64 {
    750
}

fn default_scheduler() -> String {
    "ddim".to_string()
}

fn default_strength() -> i64 {
    50
}

fn default_image_guidance_scale() -> i64 {
    150
}

fn default_n_samples() -> u32 {
    1
}

fn default_section() -> String {
    "txt2img".to_string()
}

fn default_dimension() -> u32 {
    512
}

fn default_true() -> bool {
    true
}

/// Where the controlnet conditioning image comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ControlnetImageSource {
    #[default]
    Imported,
    CanvasLink,
    Grid,
}

/// Nested controlnet configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlnetImageSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Controlnet variant slug: canny, depth, pose, ...
    #[serde(default = "default_controlnet")]
    pub controlnet: String,

    /// Stored as value * 100.
    #[serde(default = "default_conditioning_scale")]
    pub conditioning_scale: i64,

    /// Stored as value * 100.
    #[serde(default = "default_controlnet_guidance")]
    pub guidance_scale: i64,

    #[serde(default)]
    pub image_source: ControlnetImageSource,

    #[serde(default)]
    pub imported_image_path: Option<PathBuf>,

    #[serde(default)]
    pub link_to_mask: bool,

    #[serde(default)]
    pub use_mask: bool,
}

impl Default for ControlnetImageSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            controlnet: default_controlnet(),
            conditioning_scale: default_conditioning_scale(),
            guidance_scale: default_controlnet_guidance(),
            image_source: ControlnetImageSource::default(),
            imported_image_path: None,
            link_to_mask: false,
            use_mask: false,
        }
    }
}

fn default_controlnet() -> String {
    "canny".to_string()
}

fn default_conditioning_scale() -> i64 {
    100
}

fn default_controlnet_guidance() -> i64 {
    750
}

/// Advisory memory/performance flags. The lifecycle manager is free to
/// downgrade or ignore any of these based on detected VRAM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySettings {
    #[serde(default = "default_true")]
    pub attention_slicing: bool,

    #[serde(default = "default_true")]
    pub vae_slicing: bool,

    #[serde(default)]
    pub vae_tiling: bool,

    #[serde(default)]
    pub model_cpu_offload: bool,

    #[serde(default)]
    pub sequential_cpu_offload: bool,

    #[serde(default)]
    pub channels_last: bool,

    #[serde(default = "default_true")]
    pub tf32: bool,

    #[serde(default = "default_true")]
    pub cudnn_benchmark: bool,

    #[serde(default)]
    pub graph_optimization: bool,

    /// Token-merge ratio, stored as value * 1000.
    #[serde(default = "default_tome_ratio")]
    pub tome_ratio: i64,

    #[serde(default = "default_true")]
    pub unload_unused_models: bool,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            attention_slicing: true,
            vae_slicing: true,
            vae_tiling: false,
            model_cpu_offload: false,
            sequential_cpu_offload: false,
            channels_last: false,
            tf32: true,
            cudnn_benchmark: true,
            graph_optimization: false,
            tome_ratio: default_tome_ratio(),
            unload_unused_models: true,
        }
    }
}

fn default_tome_ratio() -> i64 {
    600
}

/// Chat-model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Logical chat model name, resolved through the registry.
    #[serde(default)]
    pub model: String,

    /// Precision to load the chat model at.
    #[serde(default = "default_llm_dtype")]
    pub dtype: crate::weights::QuantDtype,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: String::new(),
            dtype: default_llm_dtype(),
        }
    }
}

fn default_llm_dtype() -> crate::weights::QuantDtype {
    crate::weights::QuantDtype::FourBit
}

/// Filesystem locations the host has configured.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PathSettings {
    #[serde(default)]
    pub base_dir: PathBuf,

    #[serde(default)]
    pub models_dir: PathBuf,

    #[serde(default)]
    pub embeddings_dir: PathBuf,

    #[serde(default)]
    pub lora_dir: PathBuf,
}

/// An axis-aligned rectangle in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Rect {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i64, y: i64, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn translated(&self, dx: i64, dy: i64) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            ..*self
        }
    }
}

/// The active-grid working area on the canvas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveGridSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub pos_x: i64,

    #[serde(default)]
    pub pos_y: i64,

    #[serde(default = "default_dimension")]
    pub width: u32,

    #[serde(default = "default_dimension")]
    pub height: u32,
}

impl Default for ActiveGridSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            pos_x: 0,
            pos_y: 0,
            width: default_dimension(),
            height: default_dimension(),
        }
    }
}

impl ActiveGridSettings {
    pub fn rect(&self) -> Rect {
        Rect::new(self.pos_x, self.pos_y, self.width, self.height)
    }
}

/// Canvas viewport state. Only the pan offset matters to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CanvasSettings {
    #[serde(default)]
    pub pan_x: i64,

    #[serde(default)]
    pub pan_y: i64,
}

/// One immutable read of everything the user has configured. Constructed
/// fresh from the store per top-level call; the engine never mutates it and
/// never reads settings from anywhere else.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SettingsSnapshot {
    #[serde(default)]
    pub generator: GeneratorSettings,

    #[serde(default)]
    pub controlnet: ControlnetImageSettings,

    #[serde(default)]
    pub memory: MemorySettings,

    #[serde(default)]
    pub llm: LlmSettings,

    #[serde(default)]
    pub paths: PathSettings,

    #[serde(default)]
    pub active_grid: ActiveGridSettings,

    #[serde(default)]
    pub canvas: CanvasSettings,
}

impl SettingsSnapshot {
    /// The grid rectangle translated into image space: the canvas pan offset
    /// is subtracted so the rect is expressed relative to the canvas origin.
    pub fn default_active_rect(&self) -> Rect {
        self.active_grid
            .rect()
            .translated(-self.canvas.pan_x, -self.canvas.pan_y)
    }
}

/// The host settings store, reduced to the read surface the engine needs.
pub trait SettingsStore: Send + Sync {
    fn snapshot(&self) -> SettingsSnapshot;
}

/// Store used by tests and by hosts that embed the engine without a
/// persistence layer.
#[derive(Debug, Default)]
pub struct InMemorySettingsStore {
    snapshot: std::sync::RwLock<SettingsSnapshot>,
}

impl InMemorySettingsStore {
    pub fn new(snapshot: SettingsSnapshot) -> Self {
        Self {
            snapshot: std::sync::RwLock::new(snapshot),
        }
    }

    pub fn update<F: FnOnce(&mut SettingsSnapshot)>(&self, f: F) {
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }
}

impl SettingsStore for InMemorySettingsStore {
    fn snapshot(&self) -> SettingsSnapshot {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_parses_all_modes() {
        for (s, mode) in [
            ("txt2img", OperationMode::Txt2Img),
            ("img2img", OperationMode::Img2Img),
            ("outpaint", OperationMode::Outpaint),
            ("inpaint", OperationMode::Outpaint),
            ("depth2img", OperationMode::Depth2Img),
            ("pix2pix", OperationMode::Pix2Pix),
            ("upscale", OperationMode::Upscale),
        ] {
            assert_eq!(s.parse::<OperationMode>().unwrap(), mode);
        }
        assert!("txt2vid".parse::<OperationMode>().is_err());
    }

    #[test]
    fn active_rect_subtracts_canvas_pan() {
        let mut snapshot = SettingsSnapshot::default();
        snapshot.active_grid.pos_x = 100;
        snapshot.active_grid.pos_y = 40;
        snapshot.canvas.pan_x = 30;
        snapshot.canvas.pan_y = -10;

        let rect = snapshot.default_active_rect();
        assert_eq!(rect.x, 70);
        assert_eq!(rect.y, 50);
        assert_eq!(rect.width, 512);
        assert_eq!(rect.height, 512);
    }

    #[test]
    fn snapshot_deserializes_from_partial_json() {
        let snapshot: SettingsSnapshot = serde_json::from_str(
            r#"{"generator": {"prompt": "a cat", "strength": 75, "section": "img2img"}}"#,
        )
        .unwrap();
        assert_eq!(snapshot.generator.prompt, "a cat");
        assert_eq!(snapshot.generator.strength, 75);
        assert_eq!(snapshot.generator.steps, 20);
        assert!(snapshot.memory.attention_slicing);
    }
}
