//! Quantization-aware weight resolution.
//!
//! Maps a model's logical path to the concrete weights to load, preferring a
//! previously-persisted quantized copy. The cache lives next to the original
//! weights in a directory named `<path>_<dtype>_quantized`; a directory only
//! counts as a cache hit when its marker files and at least one weight file
//! are present, so partial or corrupt saves degrade to a miss instead of an
//! error.
//!
//! Hard invariant: a plan built from a cache hit never carries a
//! quantization config. Re-attaching one would re-quantize already-quantized
//! tensors and corrupt them.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ModelResolutionError;

/// Weight precision to load at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantDtype {
    Full,
    EightBit,
    FourBit,
}

impl QuantDtype {
    pub fn suffix(&self) -> &'static str {
        match self {
            QuantDtype::Full => "full",
            QuantDtype::EightBit => "8bit",
            QuantDtype::FourBit => "4bit",
        }
    }
}

impl std::fmt::Display for QuantDtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Which marker files prove a cache directory is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// Multi-component pipeline layouts: `config.json` + `model_index.json`.
    Diffusers,
    /// Single-model layouts: `config.json` with an embedded
    /// `quantization_config`.
    Transformer,
}

/// Runtime quantization parameters attached when loading from original
/// weights at a reduced precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    pub load_in_8bit: bool,
    pub load_in_4bit: bool,
    pub bnb_4bit_compute_dtype: String,
    pub bnb_4bit_quant_type: String,
    pub bnb_4bit_use_double_quant: bool,
}

impl QuantizationConfig {
    /// The config for a reduced dtype; `Full` needs none.
    pub fn for_dtype(dtype: QuantDtype) -> Option<Self> {
        match dtype {
            QuantDtype::Full => None,
            QuantDtype::EightBit => Some(Self {
                load_in_8bit: true,
                load_in_4bit: false,
                bnb_4bit_compute_dtype: "bfloat16".to_string(),
                bnb_4bit_quant_type: "nf4".to_string(),
                bnb_4bit_use_double_quant: false,
            }),
            QuantDtype::FourBit => Some(Self {
                load_in_8bit: false,
                load_in_4bit: true,
                bnb_4bit_compute_dtype: "bfloat16".to_string(),
                bnb_4bit_quant_type: "nf4".to_string(),
                bnb_4bit_use_double_quant: true,
            }),
        }
    }
}

/// The resolved answer: where to load from and how.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadPlan {
    /// Directory the loader should read.
    pub weights_path: PathBuf,
    pub dtype: QuantDtype,
    /// Present only when quantizing at load time from original weights.
    pub quantization: Option<QuantizationConfig>,
    /// Where the freshly-quantized model should be persisted afterwards.
    pub persist_to: Option<PathBuf>,
    pub from_cache: bool,
}

/// Cache directory for `(original, dtype)`: sibling of the original weights.
pub fn quantized_cache_dir(original: &Path, dtype: QuantDtype) -> PathBuf {
    let name = original
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    original.with_file_name(format!("{}_{}_quantized", name, dtype.suffix()))
}

fn has_weight_file(dir: &Path) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if has_weight_file(&path) {
                return true;
            }
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("safetensors") | Some("bin")
        ) {
            return true;
        }
    }
    false
}

/// Whether a cache directory is usable. Missing markers, an unparseable
/// config, or the absence of any weight file all mean "miss".
pub fn cache_is_valid(dir: &Path, family: ModelFamily) -> bool {
    if !dir.is_dir() {
        return false;
    }
    let config_path = dir.join("config.json");
    if !config_path.is_file() {
        return false;
    }
    match family {
        ModelFamily::Diffusers => {
            if !dir.join("model_index.json").is_file() {
                return false;
            }
        }
        ModelFamily::Transformer => {
            let Ok(content) = fs::read_to_string(&config_path) else {
                return false;
            };
            let Ok(config) = serde_json::from_str::<serde_json::Value>(&content) else {
                return false;
            };
            if config.get("quantization_config").is_none() {
                return false;
            }
        }
    }
    has_weight_file(dir)
}

/// Resolve the weights to load for `(original, dtype)`.
///
/// Missing original weights are a resolution error so the caller can request
/// a download and retry. A valid cache wins outright; otherwise reduced
/// dtypes get a fresh [`QuantizationConfig`] plus a persist target.
pub fn resolve(
    original: &Path,
    dtype: QuantDtype,
    family: ModelFamily,
) -> Result<LoadPlan, ModelResolutionError> {
    if dtype == QuantDtype::Full {
        if !original.exists() {
            return Err(ModelResolutionError::WeightsMissing(original.to_path_buf()));
        }
        return Ok(LoadPlan {
            weights_path: original.to_path_buf(),
            dtype,
            quantization: None,
            persist_to: None,
            from_cache: false,
        });
    }

    let cache_dir = quantized_cache_dir(original, dtype);
    if cache_is_valid(&cache_dir, family) {
        tracing::debug!(cache = %cache_dir.display(), "quantized cache hit");
        return Ok(LoadPlan {
            weights_path: cache_dir,
            dtype,
            quantization: None,
            persist_to: None,
            from_cache: true,
        });
    }

    if !original.exists() {
        return Err(ModelResolutionError::WeightsMissing(original.to_path_buf()));
    }

    tracing::debug!(
        cache = %cache_dir.display(),
        "quantized cache miss, will quantize at load time"
    );
    Ok(LoadPlan {
        weights_path: original.to_path_buf(),
        dtype,
        quantization: QuantizationConfig::for_dtype(dtype),
        persist_to: Some(cache_dir),
        from_cache: false,
    })
}

/// Persist a freshly-quantized model so the next resolve hits the cache.
///
/// `config` is the model's own config document; the quantization config is
/// embedded into it. `weights` are `(file name, serialized bytes)` pairs.
/// Best-effort: a failure is logged and reported as `false`, never fatal —
/// the already-loaded model stays usable for the session. Concurrent writers
/// are tolerated because the output is a pure function of the input.
pub fn persist_quantized(
    dir: &Path,
    family: ModelFamily,
    config: &serde_json::Value,
    quant: &QuantizationConfig,
    weights: &[(String, Vec<u8>)],
) -> bool {
    match try_persist(dir, family, config, quant, weights) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(
                dir = %dir.display(),
                error = %e,
                "failed to persist quantized model; keeping in-memory copy only"
            );
            false
        }
    }
}

fn try_persist(
    dir: &Path,
    family: ModelFamily,
    config: &serde_json::Value,
    quant: &QuantizationConfig,
    weights: &[(String, Vec<u8>)],
) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;

    let mut config = config.clone();
    if let Some(obj) = config.as_object_mut() {
        obj.insert(
            "quantization_config".to_string(),
            serde_json::to_value(quant).unwrap_or(serde_json::Value::Null),
        );
    }
    fs::write(
        dir.join("config.json"),
        serde_json::to_string_pretty(&config)?,
    )?;

    if family == ModelFamily::Diffusers {
        let index = serde_json::json!({
            "_class_name": config.get("_class_name").cloned().unwrap_or(serde_json::Value::Null),
            "quantized": true,
        });
        fs::write(
            dir.join("model_index.json"),
            serde_json::to_string_pretty(&index)?,
        )?;
    }

    for (name, bytes) in weights {
        let target = dir.join(name);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, bytes)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn original_model(dir: &Path) -> PathBuf {
        let model = dir.join("my-model");
        fs::create_dir_all(&model).unwrap();
        fs::write(model.join("config.json"), "{}").unwrap();
        fs::write(model.join("model.safetensors"), b"weights").unwrap();
        model
    }

    #[test]
    fn cache_dir_naming() {
        let dir = quantized_cache_dir(Path::new("/models/my-model"), QuantDtype::FourBit);
        assert_eq!(dir, PathBuf::from("/models/my-model_4bit_quantized"));
        let dir = quantized_cache_dir(Path::new("/models/my-model"), QuantDtype::EightBit);
        assert_eq!(dir, PathBuf::from("/models/my-model_8bit_quantized"));
    }

    #[test]
    fn full_precision_resolves_to_original() {
        let tmp = TempDir::new().unwrap();
        let model = original_model(tmp.path());
        let plan = resolve(&model, QuantDtype::Full, ModelFamily::Transformer).unwrap();
        assert_eq!(plan.weights_path, model);
        assert!(plan.quantization.is_none());
        assert!(!plan.from_cache);
    }

    #[test]
    fn missing_original_is_a_resolution_error() {
        let tmp = TempDir::new().unwrap();
        let err = resolve(
            &tmp.path().join("nope"),
            QuantDtype::FourBit,
            ModelFamily::Transformer,
        )
        .unwrap_err();
        assert!(matches!(err, ModelResolutionError::WeightsMissing(_)));
    }

    #[test]
    fn cache_miss_attaches_quant_config_and_persist_target() {
        let tmp = TempDir::new().unwrap();
        let model = original_model(tmp.path());
        let plan = resolve(&model, QuantDtype::FourBit, ModelFamily::Transformer).unwrap();
        assert_eq!(plan.weights_path, model);
        let quant = plan.quantization.expect("quant config expected on miss");
        assert!(quant.load_in_4bit);
        assert_eq!(quant.bnb_4bit_quant_type, "nf4");
        assert_eq!(
            plan.persist_to.unwrap(),
            quantized_cache_dir(&model, QuantDtype::FourBit)
        );
    }

    #[test]
    fn partial_cache_is_a_miss_not_an_error() {
        let tmp = TempDir::new().unwrap();
        let model = original_model(tmp.path());
        let cache = quantized_cache_dir(&model, QuantDtype::FourBit);

        // Directory with a config but no weight files.
        fs::create_dir_all(&cache).unwrap();
        fs::write(
            cache.join("config.json"),
            r#"{"quantization_config": {}}"#,
        )
        .unwrap();
        assert!(!cache_is_valid(&cache, ModelFamily::Transformer));

        let plan = resolve(&model, QuantDtype::FourBit, ModelFamily::Transformer).unwrap();
        assert!(!plan.from_cache);
        assert!(plan.quantization.is_some());
    }

    #[test]
    fn transformer_cache_requires_embedded_quant_config() {
        let tmp = TempDir::new().unwrap();
        let cache = tmp.path().join("m_4bit_quantized");
        fs::create_dir_all(&cache).unwrap();
        fs::write(cache.join("config.json"), "{}").unwrap();
        fs::write(cache.join("model.safetensors"), b"w").unwrap();
        assert!(!cache_is_valid(&cache, ModelFamily::Transformer));
    }

    #[test]
    fn diffusers_cache_requires_model_index() {
        let tmp = TempDir::new().unwrap();
        let cache = tmp.path().join("m_4bit_quantized");
        fs::create_dir_all(&cache).unwrap();
        fs::write(cache.join("config.json"), "{}").unwrap();
        fs::write(cache.join("unet.safetensors"), b"w").unwrap();
        assert!(!cache_is_valid(&cache, ModelFamily::Diffusers));

        fs::write(cache.join("model_index.json"), "{}").unwrap();
        assert!(cache_is_valid(&cache, ModelFamily::Diffusers));
    }

    #[test]
    fn second_resolve_hits_cache_written_by_first() {
        let tmp = TempDir::new().unwrap();
        let model = original_model(tmp.path());

        let first = resolve(&model, QuantDtype::FourBit, ModelFamily::Transformer).unwrap();
        let quant = first.quantization.clone().unwrap();
        let persist_to = first.persist_to.clone().unwrap();

        // Simulate the runtime saving the quantized weights after load.
        assert!(persist_quantized(
            &persist_to,
            ModelFamily::Transformer,
            &serde_json::json!({"model_type": "llama"}),
            &quant,
            &[("model.safetensors".to_string(), b"qweights".to_vec())],
        ));

        let second = resolve(&model, QuantDtype::FourBit, ModelFamily::Transformer).unwrap();
        assert!(second.from_cache);
        assert_eq!(second.weights_path, persist_to);
        // The hard invariant: a cache hit never re-attaches quantization.
        assert!(second.quantization.is_none());
        assert!(second.persist_to.is_none());
    }

    #[test]
    fn persist_failure_is_reported_not_fatal() {
        // A file where the directory should go makes create_dir_all fail.
        let tmp = TempDir::new().unwrap();
        let blocked = tmp.path().join("blocked");
        fs::write(&blocked, b"file in the way").unwrap();
        let saved = persist_quantized(
            &blocked,
            ModelFamily::Transformer,
            &serde_json::json!({}),
            &QuantizationConfig::for_dtype(QuantDtype::FourBit).unwrap(),
            &[],
        );
        assert!(!saved);
    }
}
