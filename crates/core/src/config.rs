//! Engine configuration file.
//!
//! Lives at `~/.config/artforge/config.toml`. Every section is
//! serde-defaulted so a missing or partial file always yields a usable
//! config.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub models: ModelsConfig,

    #[serde(default)]
    pub inference: InferenceConfig,

    #[serde(default)]
    pub vram: VramPolicy,

    #[serde(default)]
    pub context: ContextConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Directory models are downloaded into (default: ~/.config/artforge/models/)
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// HuggingFace token for gated models
    #[serde(default)]
    pub hf_token: Option<String>,
}

fn default_storage_path() -> PathBuf {
    Config::base_dir()
        .map(|p| p.join("models"))
        .unwrap_or_else(|_| PathBuf::from("~/.config/artforge/models"))
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            hf_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_top_k")]
    pub top_k: u32,

    /// Use GPU acceleration (Metal on macOS, CUDA on Linux)
    #[serde(default = "default_use_gpu")]
    pub use_gpu: bool,
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

fn default_top_k() -> u32 {
    40
}

fn default_use_gpu() -> bool {
    true
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            use_gpu: default_use_gpu(),
        }
    }
}

/// VRAM tier thresholds. These are deployment policy, not hardware facts:
/// the defaults target common 24GB/16GB consumer cards and can be tuned
/// per install.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VramPolicy {
    /// At or above this many GB the model stays fully resident.
    #[serde(default = "default_full_residency_gb")]
    pub full_residency_gb: f64,

    /// Below this many GB sequential CPU offload is enabled on top of
    /// model-level offload.
    #[serde(default = "default_sequential_offload_below_gb")]
    pub sequential_offload_below_gb: f64,
}

fn default_full_residency_gb() -> f64 {
    24.0
}

fn default_sequential_offload_below_gb() -> f64 {
    16.0
}

impl Default for VramPolicy {
    fn default() -> Self {
        Self {
            full_residency_gb: default_full_residency_gb(),
            sequential_offload_below_gb: default_sequential_offload_below_gb(),
        }
    }
}

/// Context-length policy for chat models.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Desired usable context length.
    #[serde(default = "default_target_context_len")]
    pub target_context_len: usize,

    /// Opt-in to RoPE (YaRN) scaling for models that declare support for it.
    /// Context is never extended past what a model declares.
    #[serde(default)]
    pub allow_rope_scaling: bool,
}

fn default_target_context_len() -> usize {
    8192
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            target_context_len: default_target_context_len(),
            allow_rope_scaling: false,
        }
    }
}

impl Config {
    /// Get the base directory: ~/.config/artforge/
    pub fn base_dir() -> Result<PathBuf> {
        let home = directories::BaseDirs::new()
            .map(|d| d.home_dir().to_path_buf())
            .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
        Ok(home.join(".config").join("artforge"))
    }

    /// Load config from the default location.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save config to the default location.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.toml"))
    }

    pub fn registry_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("registry.json"))
    }

    pub fn models_dir(&self) -> PathBuf {
        self.models.storage_path.clone()
    }

    pub fn logs_dir() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [vram]
            full_residency_gb = 20.0
            "#,
        )
        .unwrap();
        assert_eq!(config.vram.full_residency_gb, 20.0);
        assert_eq!(config.vram.sequential_offload_below_gb, 16.0);
        assert_eq!(config.inference.max_tokens, 2048);
        assert!(!config.context.allow_rope_scaling);
    }
}
