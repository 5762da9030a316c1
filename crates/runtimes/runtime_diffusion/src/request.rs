//! Generation-request assembly.
//!
//! [`RequestBuilder::build`] is the one place a settings snapshot plus
//! call-time overrides become the flat keyword-argument bundle a pipeline
//! call consumes. Each operation mode has its own mandatory key subset;
//! prompt text and precomputed prompt embeddings are mutually exclusive in
//! the output.

use serde_json::{Map, Value};

use artforge_core::error::{ArtforgeError, UnsupportedOperationError};
use artforge_core::models::ModelIdentity;
use artforge_core::registry::ModelLookup;
use artforge_core::settings::{
    ControlnetImageSource, MemorySettings, OperationMode, Rect, SettingsSnapshot,
};
use artforge_core::units;

use crate::{ImageInput, SchedulerKind, TensorRef};

/// Call-time overrides layered on top of the snapshot. Everything is
/// optional; an empty value reproduces pure settings-driven behavior.
#[derive(Debug, Clone, Default)]
pub struct BuildOverrides {
    /// Operation mode override (otherwise `settings.generator.section`).
    pub mode: Option<OperationMode>,

    /// Fully-resolved model; skips the registry lookup.
    pub model: Option<ModelIdentity>,

    /// Partially-populated identity; missing fields are backfilled from the
    /// registry resolution.
    pub model_data: Option<ModelIdentity>,

    pub active_rect: Option<Rect>,

    /// Already-normalized strength in [0, 1].
    pub strength: Option<f64>,

    /// The image the current mode operates on (host resolves `Canvas`
    /// placeholders to concrete data before building).
    pub image: Option<ImageInput>,

    pub mask_image: Option<ImageInput>,

    pub controlnet_image: Option<ImageInput>,

    pub prompt_embeds: Option<TensorRef>,

    pub negative_prompt_embeds: Option<TensorRef>,

    pub latents: Option<TensorRef>,

    /// Memory flags for this call; falls back to the snapshot's.
    pub memory_options: Option<MemorySettings>,

    /// Wins over everything merged before it.
    pub extra_options: Map<String, Value>,
}

/// The assembled request: the operation mode, the fully-backfilled model,
/// and the flat kwargs the pipeline call receives.
#[derive(Debug, Clone)]
pub struct RequestBundle {
    pub action: OperationMode,
    pub model: ModelIdentity,
    kwargs: Map<String, Value>,
}

impl RequestBundle {
    /// An argument-less bundle, for callers that drive a pipeline outside
    /// the builder (tests, warm-up runs).
    pub fn empty(action: OperationMode, model: ModelIdentity) -> Self {
        Self {
            action,
            model,
            kwargs: Map::new(),
        }
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.kwargs.contains_key(key)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.kwargs.get(key).and_then(Value::as_f64)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.kwargs.get(key).and_then(Value::as_u64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.kwargs.get(key).and_then(Value::as_str)
    }

    /// Typed read of a structured kwarg (images, tensor refs).
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.kwargs
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

pub struct RequestBuilder<'a> {
    lookup: &'a dyn ModelLookup,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(lookup: &'a dyn ModelLookup) -> Self {
        Self { lookup }
    }

    pub fn build(
        &self,
        settings: &SettingsSnapshot,
        overrides: BuildOverrides,
    ) -> Result<RequestBundle, ArtforgeError> {
        let action = match overrides.mode {
            Some(mode) => mode,
            None => settings.generator.section.parse::<OperationMode>()?,
        };

        let model = self.resolve_model(settings, &overrides)?;
        let scheduler = settings.generator.scheduler.parse::<SchedulerKind>()?;

        let active_rect = overrides
            .active_rect
            .unwrap_or_else(|| settings.default_active_rect());

        let mut kwargs = Map::new();

        // Base arguments shared by every mode.
        kwargs.insert(
            "prompt".into(),
            Value::String(settings.generator.prompt.clone()),
        );
        kwargs.insert(
            "negative_prompt".into(),
            Value::String(settings.generator.negative_prompt.clone()),
        );
        kwargs.insert(
            "num_inference_steps".into(),
            Value::from(settings.generator.steps),
        );
        kwargs.insert(
            "guidance_scale".into(),
            Value::from(units::percent(settings.generator.scale)),
        );
        kwargs.insert(
            "scheduler".into(),
            Value::String(scheduler.as_str().to_string()),
        );
        if settings.generator.clip_skip > 0 {
            kwargs.insert("clip_skip".into(), Value::from(settings.generator.clip_skip));
        }
        if !settings.generator.random_seed {
            kwargs.insert("seed".into(), Value::from(settings.generator.seed));
        }

        // Latents are injected generically; modes that reject them strip
        // them below.
        if let Some(latents) = &overrides.latents {
            kwargs.insert("latents".into(), json(latents));
        }

        self.apply_controlnet(settings, &overrides, &mut kwargs)?;
        self.apply_mode_arguments(action, settings, &overrides, active_rect, &mut kwargs)?;
        self.apply_embeddings(&overrides, &mut kwargs);

        kwargs.insert(
            "options".into(),
            Value::Object(Self::merged_options(settings, &overrides)),
        );

        Ok(RequestBundle {
            action,
            model,
            kwargs,
        })
    }

    /// Precedence: explicit model > override model_data backfilled from the
    /// registry > settings model name. A request never carries a partially
    /// populated identity.
    fn resolve_model(
        &self,
        settings: &SettingsSnapshot,
        overrides: &BuildOverrides,
    ) -> Result<ModelIdentity, ArtforgeError> {
        if let Some(model) = &overrides.model {
            return Ok(model.clone());
        }

        let name = overrides
            .model_data
            .as_ref()
            .map(|m| m.name.as_str())
            .filter(|n| !n.is_empty())
            .unwrap_or(settings.generator.model.as_str());

        let resolved = self.lookup.resolve_by_name(name)?;

        Ok(match &overrides.model_data {
            Some(partial) => {
                let mut merged = partial.clone();
                merged.backfill_from(&resolved);
                merged
            }
            None => resolved,
        })
    }

    fn apply_controlnet(
        &self,
        settings: &SettingsSnapshot,
        overrides: &BuildOverrides,
        kwargs: &mut Map<String, Value>,
    ) -> Result<(), ArtforgeError> {
        let cn = &settings.controlnet;
        if !cn.enabled {
            return Ok(());
        }

        let control_image = overrides
            .controlnet_image
            .clone()
            .or_else(|| match cn.image_source {
                ControlnetImageSource::Imported => cn
                    .imported_image_path
                    .clone()
                    .map(|path| ImageInput::Path { path }),
                ControlnetImageSource::CanvasLink | ControlnetImageSource::Grid => {
                    Some(ImageInput::Canvas)
                }
            })
            .ok_or(UnsupportedOperationError::MissingInput {
                mode: "controlnet".into(),
                input: "control_image".into(),
            })?;

        kwargs.insert("control_image".into(), json(&control_image));
        kwargs.insert("controlnet".into(), Value::String(cn.controlnet.clone()));
        kwargs.insert(
            "controlnet_conditioning_scale".into(),
            Value::from(units::percent(cn.conditioning_scale)),
        );
        kwargs.insert(
            "controlnet_guidance_scale".into(),
            Value::from(units::percent(cn.guidance_scale)),
        );
        Ok(())
    }

    /// Each mode needs a different subset of
    /// `{image, mask_image, strength, image_guidance_scale, height, width}`.
    fn apply_mode_arguments(
        &self,
        action: OperationMode,
        settings: &SettingsSnapshot,
        overrides: &BuildOverrides,
        active_rect: Rect,
        kwargs: &mut Map<String, Value>,
    ) -> Result<(), ArtforgeError> {
        let strength = overrides
            .strength
            .unwrap_or_else(|| units::percent(settings.generator.strength));

        match action {
            OperationMode::Txt2Img => {
                kwargs.insert("width".into(), Value::from(active_rect.width));
                kwargs.insert("height".into(), Value::from(active_rect.height));
            }
            OperationMode::Img2Img => {
                kwargs.insert("image".into(), self.required_image(action, overrides)?);
                kwargs.insert("strength".into(), Value::from(strength));
                kwargs.remove("latents");
            }
            OperationMode::Depth2Img => {
                kwargs.insert("image".into(), self.required_image(action, overrides)?);
                kwargs.insert("strength".into(), Value::from(strength));
                kwargs.remove("latents");
            }
            OperationMode::Pix2Pix => {
                kwargs.insert("image".into(), self.required_image(action, overrides)?);
                kwargs.insert(
                    "image_guidance_scale".into(),
                    Value::from(units::image_guidance(
                        settings.generator.image_guidance_scale,
                    )),
                );
                // pix2pix pipelines reject latents outright, even ones that
                // arrived through the generic path.
                if kwargs.remove("latents").is_some() {
                    tracing::debug!("dropping latents override for pix2pix");
                }
            }
            OperationMode::Outpaint => {
                kwargs.insert("image".into(), self.required_image(action, overrides)?);
                let mask = overrides.mask_image.clone().ok_or(
                    UnsupportedOperationError::MissingInput {
                        mode: action.as_str().into(),
                        input: "mask_image".into(),
                    },
                )?;
                kwargs.insert("mask_image".into(), json(&mask));
                kwargs.insert("width".into(), Value::from(active_rect.width));
                kwargs.insert("height".into(), Value::from(active_rect.height));
                kwargs.remove("latents");
            }
            OperationMode::Upscale => {
                kwargs.insert("image".into(), self.required_image(action, overrides)?);
                kwargs.remove("latents");
            }
        }
        Ok(())
    }

    fn required_image(
        &self,
        action: OperationMode,
        overrides: &BuildOverrides,
    ) -> Result<Value, UnsupportedOperationError> {
        overrides
            .image
            .as_ref()
            .map(json)
            .ok_or(UnsupportedOperationError::MissingInput {
                mode: action.as_str().into(),
                input: "image".into(),
            })
    }

    /// When embeddings are supplied, the textual prompt keys are removed
    /// entirely; exactly one representation reaches the pipeline.
    fn apply_embeddings(&self, overrides: &BuildOverrides, kwargs: &mut Map<String, Value>) {
        let Some(embeds) = &overrides.prompt_embeds else {
            return;
        };
        kwargs.insert("prompt_embeds".into(), json(embeds));
        if let Some(neg) = &overrides.negative_prompt_embeds {
            kwargs.insert("negative_prompt_embeds".into(), json(neg));
        }
        kwargs.remove("prompt");
        kwargs.remove("negative_prompt");
    }

    /// Merge order: base options, then memory flags (override or snapshot),
    /// then extra options. Later entries win.
    fn merged_options(
        settings: &SettingsSnapshot,
        overrides: &BuildOverrides,
    ) -> Map<String, Value> {
        let mut options = Map::new();
        options.insert(
            "n_samples".into(),
            Value::from(settings.generator.n_samples),
        );

        let memory = overrides
            .memory_options
            .as_ref()
            .unwrap_or(&settings.memory);
        options.insert(
            "attention_slicing".into(),
            Value::Bool(memory.attention_slicing),
        );
        options.insert("vae_slicing".into(), Value::Bool(memory.vae_slicing));
        options.insert("vae_tiling".into(), Value::Bool(memory.vae_tiling));
        options.insert(
            "model_cpu_offload".into(),
            Value::Bool(memory.model_cpu_offload),
        );
        options.insert(
            "sequential_cpu_offload".into(),
            Value::Bool(memory.sequential_cpu_offload),
        );
        options.insert("channels_last".into(), Value::Bool(memory.channels_last));
        options.insert("tf32".into(), Value::Bool(memory.tf32));
        options.insert(
            "cudnn_benchmark".into(),
            Value::Bool(memory.cudnn_benchmark),
        );
        options.insert(
            "graph_optimization".into(),
            Value::Bool(memory.graph_optimization),
        );
        options.insert(
            "tome_ratio".into(),
            Value::from(units::permille(memory.tome_ratio)),
        );

        for (key, value) in &overrides.extra_options {
            options.insert(key.clone(), value.clone());
        }
        options
    }
}

fn json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use artforge_core::error::ModelResolutionError;
    use artforge_core::models::{ModelCategory, PipelineAction};
    use std::collections::HashMap;
    use std::path::PathBuf;

    struct FixedLookup(HashMap<String, ModelIdentity>);

    impl FixedLookup {
        fn with(names: &[&str]) -> Self {
            Self(
                names
                    .iter()
                    .map(|n| (n.to_string(), identity(n)))
                    .collect(),
            )
        }
    }

    impl ModelLookup for FixedLookup {
        fn resolve_by_name(&self, name: &str) -> Result<ModelIdentity, ModelResolutionError> {
            if name.is_empty() {
                return Err(ModelResolutionError::MissingName);
            }
            self.0
                .get(name)
                .cloned()
                .ok_or_else(|| ModelResolutionError::UnknownModel(name.to_string()))
        }
    }

    fn identity(name: &str) -> ModelIdentity {
        ModelIdentity {
            name: name.to_string(),
            path: PathBuf::from(format!("/models/{name}")),
            branch: Some("main".into()),
            version: Some("1.5".into()),
            category: ModelCategory::StableDiffusion,
            pipeline_action: PipelineAction::Txt2Img,
            enabled: true,
            is_default: false,
        }
    }

    fn snapshot(section: &str) -> SettingsSnapshot {
        let mut snapshot = SettingsSnapshot::default();
        snapshot.generator.model = "sd-v1-5".into();
        snapshot.generator.section = section.into();
        snapshot.generator.prompt = "a lighthouse at dusk".into();
        snapshot.generator.negative_prompt = "blurry".into();
        snapshot
    }

    fn canvas_image() -> ImageInput {
        ImageInput::Path {
            path: PathBuf::from("/tmp/canvas.png"),
        }
    }

    #[test]
    fn txt2img_key_set() {
        let lookup = FixedLookup::with(&["sd-v1-5"]);
        let builder = RequestBuilder::new(&lookup);
        let bundle = builder
            .build(&snapshot("txt2img"), BuildOverrides::default())
            .unwrap();

        assert_eq!(bundle.action, OperationMode::Txt2Img);
        assert!(bundle.contains("width"));
        assert!(bundle.contains("height"));
        for absent in ["image", "mask_image", "strength", "image_guidance_scale"] {
            assert!(!bundle.contains(absent), "unexpected key {absent}");
        }
        assert_eq!(bundle.get_str("prompt"), Some("a lighthouse at dusk"));
        assert_eq!(bundle.get_f64("guidance_scale"), Some(7.5));
    }

    #[test]
    fn img2img_normalizes_stored_strength() {
        let mut settings = snapshot("img2img");
        settings.generator.strength = 75;

        let lookup = FixedLookup::with(&["sd-v1-5"]);
        let builder = RequestBuilder::new(&lookup);
        let bundle = builder
            .build(
                &settings,
                BuildOverrides {
                    image: Some(canvas_image()),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(bundle.get_f64("strength"), Some(0.75));
        assert!(bundle.contains("image"));
        assert!(!bundle.contains("width"));
        assert!(!bundle.contains("height"));
    }

    #[test]
    fn pix2pix_scales_image_guidance_and_rejects_latents() {
        let mut settings = snapshot("pix2pix");
        settings.generator.image_guidance_scale = 1500;

        let lookup = FixedLookup::with(&["sd-v1-5"]);
        let builder = RequestBuilder::new(&lookup);
        let bundle = builder
            .build(
                &settings,
                BuildOverrides {
                    image: Some(canvas_image()),
                    latents: Some(TensorRef("lat-1".into())),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(bundle.get_f64("image_guidance_scale"), Some(15.0));
        assert!(!bundle.contains("latents"));
        assert!(!bundle.contains("strength"));
    }

    #[test]
    fn depth2img_and_upscale_key_sets() {
        let lookup = FixedLookup::with(&["sd-v1-5"]);
        let builder = RequestBuilder::new(&lookup);

        let bundle = builder
            .build(
                &snapshot("depth2img"),
                BuildOverrides {
                    image: Some(canvas_image()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(bundle.contains("image"));
        assert!(bundle.contains("strength"));
        for absent in ["width", "height", "mask_image", "image_guidance_scale"] {
            assert!(!bundle.contains(absent), "unexpected key {absent}");
        }

        let bundle = builder
            .build(
                &snapshot("upscale"),
                BuildOverrides {
                    image: Some(canvas_image()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(bundle.contains("image"));
        for absent in ["strength", "width", "height", "mask_image", "latents"] {
            assert!(!bundle.contains(absent), "unexpected key {absent}");
        }
    }

    #[test]
    fn txt2img_keeps_latents_override() {
        let lookup = FixedLookup::with(&["sd-v1-5"]);
        let builder = RequestBuilder::new(&lookup);
        let bundle = builder
            .build(
                &snapshot("txt2img"),
                BuildOverrides {
                    latents: Some(TensorRef("lat-1".into())),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(bundle.get_str("latents"), Some("lat-1"));
    }

    #[test]
    fn outpaint_requires_mask() {
        let lookup = FixedLookup::with(&["sd-v1-5"]);
        let builder = RequestBuilder::new(&lookup);

        let err = builder
            .build(
                &snapshot("outpaint"),
                BuildOverrides {
                    image: Some(canvas_image()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ArtforgeError::UnsupportedOperation(UnsupportedOperationError::MissingInput { .. })
        ));

        let bundle = builder
            .build(
                &snapshot("outpaint"),
                BuildOverrides {
                    image: Some(canvas_image()),
                    mask_image: Some(canvas_image()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(bundle.contains("mask_image"));
        assert!(bundle.contains("width"));
        assert!(bundle.contains("height"));
    }

    #[test]
    fn embeddings_replace_prompt_text() {
        let lookup = FixedLookup::with(&["sd-v1-5"]);
        let builder = RequestBuilder::new(&lookup);
        let bundle = builder
            .build(
                &snapshot("txt2img"),
                BuildOverrides {
                    prompt_embeds: Some(TensorRef("pe".into())),
                    negative_prompt_embeds: Some(TensorRef("npe".into())),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(bundle.contains("prompt_embeds"));
        assert!(bundle.contains("negative_prompt_embeds"));
        assert!(!bundle.contains("prompt"));
        assert!(!bundle.contains("negative_prompt"));
    }

    #[test]
    fn text_present_when_no_embeddings() {
        let lookup = FixedLookup::with(&["sd-v1-5"]);
        let builder = RequestBuilder::new(&lookup);
        let bundle = builder
            .build(&snapshot("txt2img"), BuildOverrides::default())
            .unwrap();
        assert!(bundle.contains("prompt"));
        assert!(bundle.contains("negative_prompt"));
        assert!(!bundle.contains("prompt_embeds"));
    }

    #[test]
    fn unknown_section_is_unsupported() {
        let lookup = FixedLookup::with(&["sd-v1-5"]);
        let builder = RequestBuilder::new(&lookup);
        let err = builder
            .build(&snapshot("txt2video"), BuildOverrides::default())
            .unwrap_err();
        assert!(matches!(
            err,
            ArtforgeError::UnsupportedOperation(UnsupportedOperationError::UnknownSection { .. })
        ));
    }

    #[test]
    fn unknown_model_is_resolution_error() {
        let lookup = FixedLookup::with(&[]);
        let builder = RequestBuilder::new(&lookup);
        let err = builder
            .build(&snapshot("txt2img"), BuildOverrides::default())
            .unwrap_err();
        assert!(matches!(err, ArtforgeError::ModelResolution(_)));
    }

    #[test]
    fn model_data_backfilled_from_registry() {
        let lookup = FixedLookup::with(&["sd-v1-5"]);
        let builder = RequestBuilder::new(&lookup);
        let partial = ModelIdentity {
            name: "sd-v1-5".into(),
            path: PathBuf::new(),
            branch: None,
            version: None,
            category: ModelCategory::Unknown,
            pipeline_action: PipelineAction::Txt2Img,
            enabled: true,
            is_default: false,
        };
        let bundle = builder
            .build(
                &snapshot("txt2img"),
                BuildOverrides {
                    model_data: Some(partial),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(bundle.model.path, PathBuf::from("/models/sd-v1-5"));
        assert_eq!(bundle.model.branch.as_deref(), Some("main"));
        assert_eq!(bundle.model.category, ModelCategory::StableDiffusion);
    }

    #[test]
    fn active_rect_defaults_to_grid_minus_pan() {
        let mut settings = snapshot("txt2img");
        settings.active_grid.width = 768;
        settings.active_grid.height = 640;
        settings.canvas.pan_x = 128;

        let lookup = FixedLookup::with(&["sd-v1-5"]);
        let builder = RequestBuilder::new(&lookup);
        let bundle = builder
            .build(&settings, BuildOverrides::default())
            .unwrap();

        assert_eq!(bundle.get_u64("width"), Some(768));
        assert_eq!(bundle.get_u64("height"), Some(640));
    }

    #[test]
    fn option_merge_precedence_extra_wins() {
        let mut settings = snapshot("txt2img");
        settings.memory.vae_tiling = false;

        let mut extra = Map::new();
        extra.insert("vae_tiling".into(), Value::Bool(true));
        extra.insert("custom_flag".into(), Value::from(3));

        let lookup = FixedLookup::with(&["sd-v1-5"]);
        let builder = RequestBuilder::new(&lookup);
        let bundle = builder
            .build(
                &settings,
                BuildOverrides {
                    extra_options: extra,
                    ..Default::default()
                },
            )
            .unwrap();

        let options = bundle.get("options").and_then(Value::as_object).unwrap();
        assert_eq!(options.get("vae_tiling"), Some(&Value::Bool(true)));
        assert_eq!(options.get("custom_flag"), Some(&Value::from(3)));
        // Untouched memory flags come from the snapshot.
        assert_eq!(options.get("attention_slicing"), Some(&Value::Bool(true)));
        assert_eq!(options.get("tome_ratio"), Some(&Value::from(0.6)));
    }

    #[test]
    fn memory_override_replaces_snapshot_flags() {
        let settings = snapshot("txt2img");
        let memory = MemorySettings {
            attention_slicing: false,
            ..Default::default()
        };

        let lookup = FixedLookup::with(&["sd-v1-5"]);
        let builder = RequestBuilder::new(&lookup);
        let bundle = builder
            .build(
                &settings,
                BuildOverrides {
                    memory_options: Some(memory),
                    ..Default::default()
                },
            )
            .unwrap();

        let options = bundle.get("options").and_then(Value::as_object).unwrap();
        assert_eq!(options.get("attention_slicing"), Some(&Value::Bool(false)));
    }

    #[test]
    fn controlnet_scales_divided_by_100() {
        let mut settings = snapshot("txt2img");
        settings.controlnet.enabled = true;
        settings.controlnet.conditioning_scale = 85;
        settings.controlnet.guidance_scale = 750;
        settings.controlnet.image_source = ControlnetImageSource::CanvasLink;

        let lookup = FixedLookup::with(&["sd-v1-5"]);
        let builder = RequestBuilder::new(&lookup);
        let bundle = builder
            .build(
                &settings,
                BuildOverrides {
                    controlnet_image: Some(canvas_image()),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(bundle.get_f64("controlnet_conditioning_scale"), Some(0.85));
        assert_eq!(bundle.get_f64("controlnet_guidance_scale"), Some(7.5));
        assert_eq!(bundle.get_str("controlnet"), Some("canny"));
        assert!(bundle.contains("control_image"));
    }

    #[test]
    fn seed_emitted_only_when_not_random() {
        let mut settings = snapshot("txt2img");
        settings.generator.random_seed = true;
        settings.generator.seed = 42;

        let lookup = FixedLookup::with(&["sd-v1-5"]);
        let builder = RequestBuilder::new(&lookup);
        let bundle = builder
            .build(&settings, BuildOverrides::default())
            .unwrap();
        assert!(!bundle.contains("seed"));

        settings.generator.random_seed = false;
        let bundle = builder
            .build(&settings, BuildOverrides::default())
            .unwrap();
        assert_eq!(bundle.get_u64("seed"), Some(42));
    }
}
