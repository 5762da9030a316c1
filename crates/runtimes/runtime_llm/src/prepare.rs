//! Pre-load preparation: chat-model validation, known-quirk config patching
//! and RoPE (YaRN) context scaling.

use serde_json::Value;
use std::fs;
use std::path::Path;

use artforge_core::error::{ConfigPatchFailure, ModelLoadError};

/// Model types that cannot chat. Catching these here turns a cryptic
/// weight-shape error into a message a user can act on.
const EMBEDDING_MODEL_TYPES: &[&str] = &["bert", "roberta", "distilbert", "mpnet", "xlm-roberta"];

pub fn read_config(model_dir: &Path) -> Result<Value, ModelLoadError> {
    let path = model_dir.join("config.json");
    let content = fs::read_to_string(&path).map_err(|e| ModelLoadError::InvalidConfig {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&content).map_err(|e| ModelLoadError::InvalidConfig {
        path,
        reason: e.to_string(),
    })
}

/// Fail fast if the configured path is not a loadable chat model.
pub fn validate_chat_model(model_dir: &Path) -> Result<Value, ModelLoadError> {
    let config = read_config(model_dir)?;

    let model_type = config
        .get("model_type")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if EMBEDDING_MODEL_TYPES.contains(&model_type) {
        return Err(ModelLoadError::NotAChatModel {
            path: model_dir.to_path_buf(),
            reason: format!(
                "'{model_type}' is an embedding architecture; select a text-generation model"
            ),
        });
    }

    if let Some(architectures) = config.get("architectures").and_then(Value::as_array) {
        let causal = architectures
            .iter()
            .filter_map(Value::as_str)
            .any(|a| a.ends_with("ForCausalLM") || a.ends_with("ForConditionalGeneration"));
        let bare_encoder = architectures
            .iter()
            .filter_map(Value::as_str)
            .any(|a| a.ends_with("Model") && !a.ends_with("CausalLM"));
        if !causal && bare_encoder {
            return Err(ModelLoadError::NotAChatModel {
                path: model_dir.to_path_buf(),
                reason: "config declares no causal-LM architecture".to_string(),
            });
        }
    }

    Ok(config)
}

/// Fix known upstream config incompatibilities in place.
///
/// Some model families ship configs the standard loader cannot parse
/// ("ministral3"-style releases carry a `model_type` and tokenizer class no
/// loader recognizes). The patch is idempotent: an already-patched directory
/// reports `Ok(false)`. A file that cannot be safely patched is left
/// untouched and reported as a failure for the caller to warn about.
pub fn patch_known_config_quirks(model_dir: &Path) -> Result<bool, ConfigPatchFailure> {
    let mut patched = false;

    let config_path = model_dir.join("config.json");
    if config_path.is_file() {
        let content = fs::read_to_string(&config_path).map_err(|e| ConfigPatchFailure {
            path: config_path.clone(),
            reason: e.to_string(),
        })?;
        let mut config: Value =
            serde_json::from_str(&content).map_err(|e| ConfigPatchFailure {
                path: config_path.clone(),
                reason: e.to_string(),
            })?;

        if let Some(model_type) = config.get("model_type").and_then(Value::as_str) {
            if matches!(model_type, "ministral3" | "ministral") {
                tracing::info!(
                    path = %config_path.display(),
                    from = model_type,
                    "patching incompatible model_type to 'mistral'"
                );
                config["model_type"] = Value::String("mistral".to_string());
                write_json(&config_path, &config)?;
                patched = true;
            }
        }
    }

    let tokenizer_config_path = model_dir.join("tokenizer_config.json");
    if tokenizer_config_path.is_file() {
        let content =
            fs::read_to_string(&tokenizer_config_path).map_err(|e| ConfigPatchFailure {
                path: tokenizer_config_path.clone(),
                reason: e.to_string(),
            })?;
        let mut config: Value =
            serde_json::from_str(&content).map_err(|e| ConfigPatchFailure {
                path: tokenizer_config_path.clone(),
                reason: e.to_string(),
            })?;

        if config.get("tokenizer_class").and_then(Value::as_str)
            == Some("MistralCommonTokenizer")
        {
            config["tokenizer_class"] = Value::String("LlamaTokenizer".to_string());
            write_json(&tokenizer_config_path, &config)?;
            patched = true;
        }
    }

    Ok(patched)
}

fn write_json(path: &Path, value: &Value) -> Result<(), ConfigPatchFailure> {
    let content = serde_json::to_string_pretty(value).map_err(|e| ConfigPatchFailure {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    fs::write(path, content).map_err(|e| ConfigPatchFailure {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// RoPE scaling decision for one load.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RopeScalingPlan {
    pub factor: f64,
    pub original_max_position_embeddings: usize,
    pub target_context_len: usize,
}

/// Decide whether to extend the context window via YaRN scaling.
///
/// Requires the user opt-in, a target beyond the native window, and the
/// model declaring rope-scaling support (a `rope_scaling` field, even null).
/// Context is never extended past what the model declares supporting.
pub fn plan_rope_scaling(config: &Value, target: usize, opt_in: bool) -> Option<RopeScalingPlan> {
    let native = config
        .get("max_position_embeddings")
        .and_then(Value::as_u64)? as usize;
    if !opt_in || target <= native {
        return None;
    }
    if !config
        .as_object()
        .map(|o| o.contains_key("rope_scaling"))
        .unwrap_or(false)
    {
        tracing::debug!("model declares no rope_scaling support; keeping native context");
        return None;
    }
    Some(RopeScalingPlan {
        factor: target as f64 / native as f64,
        original_max_position_embeddings: native,
        target_context_len: target,
    })
}

/// Inject the scaling plan into the model config before the loader parses it.
pub fn apply_rope_scaling(config: &mut Value, plan: &RopeScalingPlan) {
    if let Some(obj) = config.as_object_mut() {
        obj.insert(
            "rope_scaling".to_string(),
            serde_json::json!({
                "rope_type": "yarn",
                "factor": plan.factor,
                "original_max_position_embeddings": plan.original_max_position_embeddings,
            }),
        );
        obj.insert(
            "max_position_embeddings".to_string(),
            Value::from(plan.target_context_len as u64),
        );
    }
}

/// The context length generation may actually use: the scaled target when a
/// plan applies, the native window otherwise.
pub fn resolved_context_len(config: &Value, target: usize, opt_in: bool) -> usize {
    let native = config
        .get("max_position_embeddings")
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .unwrap_or(2048);
    match plan_rope_scaling(config, target, opt_in) {
        Some(plan) => plan.target_context_len,
        // Without scaling, a target below native caps usage and a target
        // above it is ignored.
        None => target.min(native),
    }
}
