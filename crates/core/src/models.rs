//! Model identity and classification types.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where a model came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelSource {
    HuggingFace { repo_id: String },
    Local,
}

/// Coarse model family, used to pick a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCategory {
    StableDiffusion,
    Flux,
    Controlnet,
    Llm,
    Embedding,
    Unknown,
}

impl ModelCategory {
    pub fn from_pipeline_tag(tag: &str) -> Self {
        match tag {
            "text-generation" | "text2text-generation" => ModelCategory::Llm,
            "feature-extraction" | "sentence-similarity" => ModelCategory::Embedding,
            "text-to-image" | "image-to-image" => ModelCategory::StableDiffusion,
            _ => ModelCategory::Unknown,
        }
    }

    pub fn is_diffusion(&self) -> bool {
        matches!(
            self,
            ModelCategory::StableDiffusion | ModelCategory::Flux | ModelCategory::Controlnet
        )
    }
}

/// What a model is wired to do once loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineAction {
    Txt2Img,
    Img2Img,
    Outpaint,
    Depth2Img,
    Pix2Pix,
    Upscale,
    Chat,
    Embedding,
}

/// A fully-described model. Partially-populated identities (as they arrive
/// from call-site overrides) are completed via [`ModelIdentity::backfill_from`]
/// before use; a request never carries a half-filled identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelIdentity {
    pub name: String,

    #[serde(default)]
    pub path: PathBuf,

    #[serde(default)]
    pub branch: Option<String>,

    #[serde(default)]
    pub version: Option<String>,

    pub category: ModelCategory,

    pub pipeline_action: PipelineAction,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub is_default: bool,
}

fn default_enabled() -> bool {
    true
}

impl ModelIdentity {
    /// Fill every empty/absent field from `resolved`. Populated fields win.
    pub fn backfill_from(&mut self, resolved: &ModelIdentity) {
        if self.name.is_empty() {
            self.name = resolved.name.clone();
        }
        if self.path.as_os_str().is_empty() {
            self.path = resolved.path.clone();
        }
        if self.branch.is_none() {
            self.branch = resolved.branch.clone();
        }
        if self.version.is_none() {
            self.version = resolved.version.clone();
        }
        if self.category == ModelCategory::Unknown {
            self.category = resolved.category;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved() -> ModelIdentity {
        ModelIdentity {
            name: "sd-v1-5".into(),
            path: PathBuf::from("/models/sd-v1-5"),
            branch: Some("main".into()),
            version: Some("1.5".into()),
            category: ModelCategory::StableDiffusion,
            pipeline_action: PipelineAction::Txt2Img,
            enabled: true,
            is_default: true,
        }
    }

    #[test]
    fn backfill_fills_only_missing_fields() {
        let mut partial = ModelIdentity {
            name: "sd-v1-5".into(),
            path: PathBuf::new(),
            branch: None,
            version: Some("custom".into()),
            category: ModelCategory::Unknown,
            pipeline_action: PipelineAction::Txt2Img,
            enabled: true,
            is_default: false,
        };
        partial.backfill_from(&resolved());

        assert_eq!(partial.path, PathBuf::from("/models/sd-v1-5"));
        assert_eq!(partial.branch.as_deref(), Some("main"));
        // Populated fields are left alone.
        assert_eq!(partial.version.as_deref(), Some("custom"));
        assert_eq!(partial.category, ModelCategory::StableDiffusion);
    }

    #[test]
    fn pipeline_tag_classification() {
        assert_eq!(
            ModelCategory::from_pipeline_tag("text-generation"),
            ModelCategory::Llm
        );
        assert_eq!(
            ModelCategory::from_pipeline_tag("text-to-image"),
            ModelCategory::StableDiffusion
        );
        assert_eq!(
            ModelCategory::from_pipeline_tag("audio-classification"),
            ModelCategory::Unknown
        );
    }
}
