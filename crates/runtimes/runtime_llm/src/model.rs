//! Model loading and token-by-token generation for transformer chat models.
//!
//! Loading honors the resolved [`LoadPlan`]: a cache hit is read as-is at
//! its stored precision, while a plan carrying a quantization config loads
//! the original weights, converts them to the compute dtype, and best-effort
//! persists the result so the next load hits the cache.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::llama as llama_model;
use candle_transformers::models::phi as phi_model;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokenizers::Tokenizer;

use artforge_core::error::{GenerationError, ModelLoadError};
use artforge_core::weights::{self, LoadPlan, ModelFamily};

use crate::sampling::{Sampler, SamplingParams};

/// Why a stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFinish {
    /// EOS token.
    Stop,
    /// Token budget exhausted.
    Length,
    /// Cooperative interrupt honored mid-stream.
    Interrupted,
    /// The delta consumer went away.
    Disconnected,
}

pub struct StreamOutcome {
    pub text: String,
    pub tokens_generated: usize,
    pub finish: StreamFinish,
}

enum ModelArch {
    Llama {
        model: llama_model::Llama,
        cache: Mutex<llama_model::Cache>,
    },
    Phi(Mutex<phi_model::Model>),
}

pub struct LoadedModel {
    model: ModelArch,
    tokenizer: Tokenizer,
    device: Device,
    eos_token_id: Option<u32>,
    context_len: usize,
    model_path: PathBuf,
}

impl LoadedModel {
    /// Load per the plan. `config` is the (possibly rope-patched) model
    /// config document; `context_len` is the resolved usable window.
    pub fn load(
        plan: &LoadPlan,
        config: &Value,
        context_len: usize,
        device: &Device,
    ) -> Result<Self, ModelLoadError> {
        let model_path = &plan.weights_path;
        tracing::info!(path = %model_path.display(), from_cache = plan.from_cache, "loading chat model");

        let dtype = match device {
            Device::Cuda(_) => DType::BF16,
            _ => DType::F32,
        };

        let tokenizer_path = find_file(model_path, "tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| ModelLoadError::Tokenizer(e.to_string()))?;
        let eos_token_id = eos_token_id(&tokenizer);

        let weight_files = find_weight_files(model_path)?;
        let vb = match &plan.quantization {
            Some(quant) => {
                // Runtime quantization: pull every tensor in, convert, and
                // keep the converted map so it can be persisted for next time.
                let compute_dtype = match quant.bnb_4bit_compute_dtype.as_str() {
                    "bfloat16" if matches!(device, Device::Cuda(_)) => DType::BF16,
                    _ => dtype,
                };
                let mut tensors: HashMap<String, Tensor> = HashMap::new();
                for file in &weight_files {
                    let loaded = candle_core::safetensors::load(file, device).map_err(|e| {
                        ModelLoadError::Weights {
                            path: file.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                    for (name, tensor) in loaded {
                        let tensor =
                            tensor
                                .to_dtype(compute_dtype)
                                .map_err(|e| ModelLoadError::Weights {
                                    path: file.clone(),
                                    reason: e.to_string(),
                                })?;
                        tensors.insert(name, tensor);
                    }
                }

                if let Some(cache_dir) = &plan.persist_to {
                    persist_quantized_tensors(cache_dir, &tensors, config, quant);
                }

                VarBuilder::from_tensors(tensors, compute_dtype, device)
            }
            // Cache hits and full-precision loads mmap directly; no
            // quantization config is ever attached here.
            None => unsafe {
                VarBuilder::from_mmaped_safetensors(&weight_files, dtype, device).map_err(
                    |e| ModelLoadError::Weights {
                        path: model_path.clone(),
                        reason: e.to_string(),
                    },
                )?
            },
        };

        let model = build_architecture(config, vb, dtype, device, model_path)?;

        Ok(Self {
            model,
            tokenizer,
            device: device.clone(),
            eos_token_id,
            context_len,
            model_path: model_path.clone(),
        })
    }

    pub fn context_len(&self) -> usize {
        self.context_len
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    /// Stream tokens into `on_delta` until EOS, budget exhaustion, consumer
    /// disconnect, or interrupt. The interrupt flag is checked at every step
    /// boundary, not just at entry.
    pub fn generate_stream<F>(
        &self,
        prompt: &str,
        params: &SamplingParams,
        interrupt: &AtomicBool,
        mut on_delta: F,
    ) -> Result<StreamOutcome, GenerationError>
    where
        F: FnMut(&str) -> bool,
    {
        let tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| GenerationError::Inference(format!("tokenization error: {e}")))?;
        let input_ids = tokens.get_ids();
        let mut all_tokens = input_ids.to_vec();

        let mut sampler = Sampler::new(params);
        let mut prev_text_len = 0;
        let mut generated = 0;
        let mut finish = StreamFinish::Length;

        for _ in 0..params.max_new_tokens {
            if interrupt.load(Ordering::SeqCst) {
                finish = StreamFinish::Interrupted;
                break;
            }

            let input = Tensor::new(&all_tokens[..], &self.device)
                .and_then(|t| t.unsqueeze(0))
                .map_err(|e| GenerationError::Inference(e.to_string()))?;

            let logits = self.forward(&input, all_tokens.len())?;
            let last_logits = logits
                .squeeze(0)
                .and_then(|l| {
                    let len = l.dim(0)?;
                    l.get(len - 1)
                })
                .map_err(|e| GenerationError::Inference(e.to_string()))?;

            let next_token = sampler.sample(&last_logits)?;

            if Some(next_token) == self.eos_token_id {
                finish = StreamFinish::Stop;
                break;
            }

            all_tokens.push(next_token);
            generated += 1;

            let generated_tokens = &all_tokens[input_ids.len()..];
            let current_text = self
                .tokenizer
                .decode(generated_tokens, true)
                .map_err(|e| GenerationError::Inference(format!("decode error: {e}")))?;

            if current_text.len() > prev_text_len {
                let delta = current_text[prev_text_len..].to_string();
                prev_text_len = current_text.len();
                if !on_delta(&delta) {
                    finish = StreamFinish::Disconnected;
                    break;
                }
            }
        }

        let generated_tokens = &all_tokens[input_ids.len()..];
        let text = self
            .tokenizer
            .decode(generated_tokens, true)
            .map_err(|e| GenerationError::Inference(format!("decode error: {e}")))?;

        Ok(StreamOutcome {
            text,
            tokens_generated: generated,
            finish,
        })
    }

    fn forward(&self, input: &Tensor, seq_len: usize) -> Result<Tensor, GenerationError> {
        match &self.model {
            ModelArch::Llama { model, cache } => {
                let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
                model
                    .forward(input, seq_len - 1, &mut cache)
                    .map_err(|e| GenerationError::Inference(e.to_string()))
            }
            ModelArch::Phi(model) => {
                let mut model = model.lock().unwrap_or_else(|e| e.into_inner());
                model
                    .forward(input)
                    .map_err(|e| GenerationError::Inference(e.to_string()))
            }
        }
    }
}

/// Build the architecture named by the config. An unrecognized `model_type`
/// falls back to the generic llama-shaped loader before giving up.
fn build_architecture(
    config: &Value,
    vb: VarBuilder,
    dtype: DType,
    device: &Device,
    model_path: &Path,
) -> Result<ModelArch, ModelLoadError> {
    let config_str = config.to_string();
    let model_type = config
        .get("model_type")
        .and_then(Value::as_str)
        .unwrap_or("llama");

    match model_type {
        "phi" | "phi-msft" | "phi2" => {
            tracing::info!("loading phi model");
            let config: phi_model::Config =
                serde_json::from_str(&config_str).map_err(|e| ModelLoadError::InvalidConfig {
                    path: model_path.join("config.json"),
                    reason: e.to_string(),
                })?;
            let model =
                phi_model::Model::new(&config, vb).map_err(|e| ModelLoadError::Weights {
                    path: model_path.to_path_buf(),
                    reason: e.to_string(),
                })?;
            Ok(ModelArch::Phi(Mutex::new(model)))
        }
        other => {
            if !matches!(other, "llama" | "mistral") {
                tracing::warn!(
                    model_type = other,
                    "unrecognized model_type; falling back to generic llama loader"
                );
            }
            let config: llama_model::LlamaConfig =
                serde_json::from_str(&config_str).map_err(|e| ModelLoadError::InvalidConfig {
                    path: model_path.join("config.json"),
                    reason: e.to_string(),
                })?;
            let config = config.into_config(false);
            let model =
                llama_model::Llama::load(vb, &config).map_err(|e| ModelLoadError::Weights {
                    path: model_path.to_path_buf(),
                    reason: e.to_string(),
                })?;
            let cache = llama_model::Cache::new(true, dtype, &config, device).map_err(|e| {
                ModelLoadError::Device(e.to_string())
            })?;
            Ok(ModelArch::Llama {
                model,
                cache: Mutex::new(cache),
            })
        }
    }
}

/// Best-effort persist of converted tensors plus marker files. A failure is
/// logged inside [`weights::persist_quantized`]; the in-memory model stays
/// usable either way.
fn persist_quantized_tensors(
    cache_dir: &Path,
    tensors: &HashMap<String, Tensor>,
    config: &Value,
    quant: &artforge_core::weights::QuantizationConfig,
) {
    if let Err(e) = std::fs::create_dir_all(cache_dir) {
        tracing::warn!(dir = %cache_dir.display(), error = %e, "cannot create quantized cache dir");
        return;
    }
    if let Err(e) = candle_core::safetensors::save(tensors, cache_dir.join("model.safetensors")) {
        tracing::warn!(dir = %cache_dir.display(), error = %e, "failed to save quantized weights");
        return;
    }
    weights::persist_quantized(cache_dir, ModelFamily::Transformer, config, quant, &[]);
}

fn eos_token_id(tokenizer: &Tokenizer) -> Option<u32> {
    let vocab = tokenizer.get_vocab(true);
    vocab
        .get("</s>")
        .or_else(|| vocab.get("<|endoftext|>"))
        .or_else(|| vocab.get("<eos>"))
        .or_else(|| vocab.get("<|end|>"))
        .copied()
}

fn find_file(model_path: &Path, filename: &str) -> Result<PathBuf, ModelLoadError> {
    let direct = model_path.join(filename);
    if direct.exists() {
        return Ok(direct);
    }
    let entries = std::fs::read_dir(model_path)?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() && path.file_name().map(|n| n == filename).unwrap_or(false) {
            return Ok(path);
        }
    }
    Err(ModelLoadError::Weights {
        path: model_path.to_path_buf(),
        reason: format!("could not find {filename}"),
    })
}

fn find_weight_files(model_path: &Path) -> Result<Vec<PathBuf>, ModelLoadError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(model_path)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.extension().map(|e| e == "safetensors").unwrap_or(false)
        })
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(ModelLoadError::Weights {
            path: model_path.to_path_buf(),
            reason: "no safetensors weight files found".to_string(),
        });
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_discovery_requires_safetensors() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("pytorch_model.bin"), b"legacy").unwrap();
        assert!(find_weight_files(dir.path()).is_err());

        std::fs::write(dir.path().join("model-00002.safetensors"), b"b").unwrap();
        std::fs::write(dir.path().join("model-00001.safetensors"), b"a").unwrap();
        let files = find_weight_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        // Shards come back in order.
        assert!(files[0].ends_with("model-00001.safetensors"));
    }

    #[test]
    fn nested_tokenizer_is_found() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("tokenizer.json"), "{}").unwrap();
        assert!(find_file(dir.path(), "tokenizer.json").is_ok());
        assert!(find_file(dir.path(), "missing.json").is_err());
    }
}
