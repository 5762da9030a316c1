//! Candle-backed Stable-Diffusion-family pipeline.
//!
//! Loads the usual component layout (tokenizer/, text_encoder/, unet/,
//! vae/) out of a model directory via mmapped safetensors and runs the
//! denoise loop for the operation modes the request builder emits.

use base64::Engine;
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::{self, clip, StableDiffusionConfig};
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

use artforge_core::error::{GenerationError, ModelLoadError};
use artforge_core::weights::LoadPlan;

use crate::lifecycle::MemoryPlan;
use crate::request::RequestBundle;
use crate::{
    default_device, DiffusionPipeline, GeneratedImage, ImageInput, PipelineCaps, PipelineLoader,
};

const PROMPT_TOKEN_LIMIT: usize = 77;

/// Stable Diffusion checkpoint generations this pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SdVersion {
    V1_5,
    V2_1,
}

impl SdVersion {
    fn detect(model_path: &Path) -> Self {
        let name = model_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_lowercase();
        if name.contains("2-1") || name.contains("v2") {
            SdVersion::V2_1
        } else {
            SdVersion::V1_5
        }
    }
}

pub struct SdPipeline {
    tokenizer: Tokenizer,
    text_encoder: clip::ClipTextTransformer,
    unet: stable_diffusion::unet_2d::UNet2DConditionModel,
    vae: stable_diffusion::vae::AutoEncoderKL,
    config: StableDiffusionConfig,
    device: Device,
    dtype: DType,
    model_path: PathBuf,
    #[allow(dead_code)]
    vae_slicing: bool,
}

impl std::fmt::Debug for SdPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdPipeline")
            .field("device", &self.device)
            .field("dtype", &self.dtype)
            .field("model_path", &self.model_path)
            .field("vae_slicing", &self.vae_slicing)
            .finish_non_exhaustive()
    }
}

fn find_component(model_path: &Path, component: &str, names: &[&str]) -> Option<PathBuf> {
    for name in names {
        let candidate = model_path.join(component).join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn component_weights(model_path: &Path, component: &str) -> Result<PathBuf, ModelLoadError> {
    find_component(
        model_path,
        component,
        &[
            "diffusion_pytorch_model.safetensors",
            "model.safetensors",
            "diffusion_pytorch_model.bin",
            "pytorch_model.bin",
        ],
    )
    .ok_or_else(|| ModelLoadError::Weights {
        path: model_path.join(component),
        reason: "no weight file found".to_string(),
    })
}

impl SdPipeline {
    pub fn load(model_path: &Path, device: &Device, dtype: DType) -> Result<Self, ModelLoadError> {
        tracing::info!(path = %model_path.display(), "loading stable diffusion pipeline");

        let tokenizer_path = find_component(model_path, "tokenizer", &["tokenizer.json"])
            .ok_or_else(|| ModelLoadError::Tokenizer("tokenizer.json not found".to_string()))?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| ModelLoadError::Tokenizer(e.to_string()))?;

        let version = SdVersion::detect(model_path);
        let config = match version {
            SdVersion::V1_5 => StableDiffusionConfig::v1_5(None, None, None),
            SdVersion::V2_1 => StableDiffusionConfig::v2_1(None, None, None),
        };

        let clip_weights = component_weights(model_path, "text_encoder")?;
        let text_encoder = {
            let vb = unsafe {
                VarBuilder::from_mmaped_safetensors(&[&clip_weights], dtype, device).map_err(
                    |e| ModelLoadError::Weights {
                        path: clip_weights.clone(),
                        reason: e.to_string(),
                    },
                )?
            };
            clip::ClipTextTransformer::new(vb, &config.clip).map_err(|e| {
                ModelLoadError::Weights {
                    path: clip_weights.clone(),
                    reason: e.to_string(),
                }
            })?
        };

        let unet_weights = component_weights(model_path, "unet")?;
        let unet = config
            .build_unet(&unet_weights, device, 4, false, dtype)
            .map_err(|e| ModelLoadError::Weights {
                path: unet_weights.clone(),
                reason: e.to_string(),
            })?;

        let vae_weights = component_weights(model_path, "vae")?;
        let vae = config
            .build_vae(&vae_weights, device, dtype)
            .map_err(|e| ModelLoadError::Weights {
                path: vae_weights.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            tokenizer,
            text_encoder,
            unet,
            vae,
            config,
            device: device.clone(),
            dtype,
            model_path: model_path.to_path_buf(),
            vae_slicing: false,
        })
    }

    fn encode_prompt(&self, prompt: &str) -> Result<Tensor, GenerationError> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| GenerationError::Inference(format!("tokenization failed: {e}")))?
            .get_ids()
            .to_vec();
        tokens.truncate(PROMPT_TOKEN_LIMIT);
        let pad_id = tokens.last().copied().unwrap_or(0);
        while tokens.len() < PROMPT_TOKEN_LIMIT {
            tokens.push(pad_id);
        }

        let tokens = Tensor::new(tokens.as_slice(), &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(|e| GenerationError::Inference(e.to_string()))?;
        self.text_encoder
            .forward(&tokens)
            .and_then(|t| t.to_dtype(self.dtype))
            .map_err(|e| GenerationError::Inference(e.to_string()))
    }

    /// Conditional embeddings, with the unconditional row stacked in front
    /// when classifier-free guidance is on.
    fn text_embeddings(
        &self,
        prompt: &str,
        negative_prompt: &str,
        cfg: bool,
    ) -> Result<Tensor, GenerationError> {
        let cond = self.encode_prompt(prompt)?;
        if !cfg {
            return Ok(cond);
        }
        let uncond = self.encode_prompt(negative_prompt)?;
        Tensor::cat(&[uncond, cond], 0).map_err(|e| GenerationError::Inference(e.to_string()))
    }

    fn decode_latents(&self, latents: &Tensor) -> Result<GeneratedImage, GenerationError> {
        let latents = (latents / 0.18215).map_err(|e| GenerationError::Inference(e.to_string()))?;
        let image = self
            .vae
            .decode(&latents)
            .map_err(|e| GenerationError::Inference(e.to_string()))?;
        // [-1, 1] -> [0, 255]
        let image = ((image / 2.0)
            .and_then(|i| i + 0.5)
            .and_then(|i| i.clamp(0.0, 1.0))
            .and_then(|i| (i * 255.0))
            .and_then(|i| i.to_dtype(DType::U8)))
        .map_err(|e| GenerationError::Inference(e.to_string()))?;

        let image = image
            .i(0)
            .map_err(|e| GenerationError::Inference(e.to_string()))?;
        let (_c, h, w) = image
            .dims3()
            .map_err(|e| GenerationError::Inference(e.to_string()))?;
        let pixels: Vec<u8> = image
            .permute((1, 2, 0))
            .and_then(|i| i.flatten_all())
            .and_then(|i| i.to_vec1())
            .map_err(|e| GenerationError::Inference(e.to_string()))?;

        Ok(GeneratedImage {
            pixels,
            width: w as u32,
            height: h as u32,
        })
    }

    fn encode_image_latents(&self, image: &Tensor) -> Result<Tensor, GenerationError> {
        let dist = self
            .vae
            .encode(image)
            .map_err(|e| GenerationError::Inference(e.to_string()))?;
        dist.sample()
            .and_then(|l| l * 0.18215)
            .map_err(|e| GenerationError::Inference(e.to_string()))
    }

    fn load_image_tensor(
        &self,
        input: &ImageInput,
        width: usize,
        height: usize,
    ) -> Result<Tensor, GenerationError> {
        let dynamic = match input {
            ImageInput::Canvas => return Err(GenerationError::UnresolvedCanvasImage),
            ImageInput::Path { path } => image::ImageReader::open(path)
                .map_err(|e| GenerationError::BadImage(e.to_string()))?
                .decode()
                .map_err(|e| GenerationError::BadImage(e.to_string()))?,
            ImageInput::Base64 { data } => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(data)
                    .map_err(|e| GenerationError::BadImage(e.to_string()))?;
                image::load_from_memory(&bytes)
                    .map_err(|e| GenerationError::BadImage(e.to_string()))?
            }
        };

        let resized = dynamic.resize_exact(
            width as u32,
            height as u32,
            image::imageops::FilterType::CatmullRom,
        );
        let rgb = resized.to_rgb8().into_raw();
        // HWC u8 -> NCHW in [-1, 1]
        Tensor::from_vec(rgb, (height, width, 3), &self.device)
            .and_then(|t| t.permute((2, 0, 1)))
            .and_then(|t| t.unsqueeze(0))
            .and_then(|t| t.to_dtype(self.dtype))
            .and_then(|t| (t / 127.5))
            .and_then(|t| t - 1.0)
            .map_err(|e| GenerationError::Inference(e.to_string()))
    }

    fn bundle_image(
        &self,
        bundle: &RequestBundle,
        key: &str,
        width: usize,
        height: usize,
    ) -> Result<Tensor, GenerationError> {
        let input: ImageInput = bundle
            .get_as(key)
            .ok_or_else(|| GenerationError::BadImage(format!("missing '{key}' input")))?;
        self.load_image_tensor(&input, width, height)
    }

    fn run_denoise(
        &self,
        bundle: &RequestBundle,
        init_latents: Option<&Tensor>,
        mask: Option<&Tensor>,
        width: usize,
        height: usize,
    ) -> Result<Tensor, GenerationError> {
        let map_err = |e: candle_core::Error| GenerationError::Inference(e.to_string());

        let steps = bundle.get_u64("num_inference_steps").unwrap_or(20) as usize;
        let guidance_scale = bundle.get_f64("guidance_scale").unwrap_or(7.5);
        let image_guidance = bundle.get_f64("image_guidance_scale");
        let cfg = guidance_scale > 1.0;

        if let Some(seed) = bundle.get_u64("seed") {
            self.device.set_seed(seed).map_err(map_err)?;
        }

        let prompt = bundle.get_str("prompt").unwrap_or_default();
        let negative = bundle.get_str("negative_prompt").unwrap_or_default();
        let embeddings = self.text_embeddings(prompt, negative, cfg)?;

        let mut scheduler = self
            .config
            .build_scheduler(steps)
            .map_err(|e| GenerationError::Inference(e.to_string()))?;
        let timesteps = scheduler.timesteps().to_vec();

        // img2img-style runs skip the first (1 - strength) portion of the
        // schedule; pure noise runs start from the top.
        let strength = bundle.get_f64("strength");
        let start_step = match (init_latents, strength) {
            (Some(_), Some(s)) => {
                let s = s.clamp(0.0, 1.0);
                steps.saturating_sub((s * steps as f64).round() as usize)
            }
            _ => 0,
        };

        let latent_h = height / 8;
        let latent_w = width / 8;
        let noise = Tensor::randn(0f32, 1f32, (1, 4, latent_h, latent_w), &self.device)
            .and_then(|t| t.to_dtype(self.dtype))
            .map_err(map_err)?;

        let mut latents = match init_latents {
            Some(init) if start_step < timesteps.len() => scheduler
                .add_noise(init, noise.clone(), timesteps[start_step])
                .map_err(map_err)?,
            Some(init) => init.clone(),
            None => (noise.clone() * scheduler.init_noise_sigma())
                .map_err(map_err)?,
        };

        for (index, &timestep) in timesteps.iter().enumerate() {
            if index < start_step {
                continue;
            }

            let latent_input = if cfg {
                Tensor::cat(&[&latents, &latents], 0).map_err(map_err)?
            } else {
                latents.clone()
            };
            let latent_input = scheduler
                .scale_model_input(latent_input, timestep)
                .map_err(map_err)?;

            let noise_pred = self
                .unet
                .forward(&latent_input, timestep as f64, &embeddings)
                .map_err(map_err)?;

            let noise_pred = if cfg {
                let chunks = noise_pred.chunk(2, 0).map_err(map_err)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                let guided = (cond - uncond)
                    .and_then(|d| d * guidance_scale)
                    .and_then(|d| &d + uncond)
                    .map_err(map_err)?;
                match image_guidance {
                    // pix2pix weights the image-conditioned direction again.
                    Some(ig) => (&guided - uncond)
                        .and_then(|d| d * (ig / (ig + 1.0)))
                        .and_then(|d| &d + uncond)
                        .map_err(map_err)?,
                    None => guided,
                }
            } else {
                noise_pred
            };

            latents = scheduler
                .step(&noise_pred, timestep, &latents)
                .map_err(map_err)?;

            // Inpainting keeps the unmasked region pinned to the source.
            if let (Some(mask), Some(init)) = (mask, init_latents) {
                let noised_init = scheduler
                    .add_noise(init, noise.clone(), timestep)
                    .map_err(map_err)?;
                latents = mask
                    .broadcast_mul(&latents)
                    .and_then(|masked| {
                        let inverse = mask.affine(-1.0, 1.0)?;
                        let kept = inverse.broadcast_mul(&noised_init)?;
                        masked + kept
                    })
                    .map_err(map_err)?;
            }
        }

        Ok(latents)
    }

    fn target_dims(&self, bundle: &RequestBundle) -> (usize, usize) {
        let width = bundle.get_u64("width").unwrap_or(512) as usize;
        let height = bundle.get_u64("height").unwrap_or(512) as usize;
        // Latent space works in units of 8 pixels.
        (width / 8 * 8, height / 8 * 8)
    }

    fn mask_tensor(
        &self,
        bundle: &RequestBundle,
        width: usize,
        height: usize,
    ) -> Result<Tensor, GenerationError> {
        let mask = self.bundle_image(bundle, "mask_image", width / 8, height / 8)?;
        // Collapse RGB to a single channel and binarize: >0 means "generate".
        mask.mean_keepdim(1)
            .and_then(|m| m.gt(0.0))
            .and_then(|m| m.to_dtype(self.dtype))
            .map_err(|e| GenerationError::Inference(e.to_string()))
    }
}

impl DiffusionPipeline for SdPipeline {
    fn caps(&self) -> PipelineCaps {
        PipelineCaps {
            attention_slicing: true,
            vae_slicing: true,
            vae_tiling: false,
            model_cpu_offload: false,
            sequential_cpu_offload: false,
            lora_adapters: false,
        }
    }

    fn model_path(&self) -> &Path {
        &self.model_path
    }

    fn enable_vae_slicing(&mut self) {
        self.vae_slicing = true;
    }

    fn generate(&mut self, bundle: &RequestBundle) -> Result<GeneratedImage, GenerationError> {
        use artforge_core::settings::OperationMode;

        let (width, height) = self.target_dims(bundle);

        let latents = match bundle.action {
            OperationMode::Txt2Img => self.run_denoise(bundle, None, None, width, height)?,
            OperationMode::Img2Img | OperationMode::Depth2Img | OperationMode::Pix2Pix => {
                let image = self.bundle_image(bundle, "image", width, height)?;
                let init = self.encode_image_latents(&image)?;
                self.run_denoise(bundle, Some(&init), None, width, height)?
            }
            OperationMode::Outpaint => {
                let image = self.bundle_image(bundle, "image", width, height)?;
                let init = self.encode_image_latents(&image)?;
                let mask = self.mask_tensor(bundle, width, height)?;
                self.run_denoise(bundle, Some(&init), Some(&mask), width, height)?
            }
            OperationMode::Upscale => {
                let (width, height) = (width * 2, height * 2);
                let image = self.bundle_image(bundle, "image", width, height)?;
                let init = self.encode_image_latents(&image)?;
                return self
                    .run_denoise(bundle, Some(&init), None, width, height)
                    .and_then(|l| self.decode_latents(&l));
            }
        };

        self.decode_latents(&latents)
    }
}

/// Loads [`SdPipeline`] from a resolved plan.
///
/// Candle has no bitsandbytes analog for safetensors pipelines, so reduced
/// dtypes degrade to half precision with a warning instead of blocking
/// generation; the quantize-and-persist path applies to the transformer
/// runtimes.
pub struct CandleSdLoader;

impl PipelineLoader for CandleSdLoader {
    fn load(
        &self,
        plan: &LoadPlan,
        memory: &MemoryPlan,
    ) -> Result<Box<dyn DiffusionPipeline>, ModelLoadError> {
        let device = default_device()?;
        let dtype = if plan.quantization.is_some() {
            tracing::warn!(
                dtype = %plan.dtype,
                "requested quantization unavailable for diffusion weights; using half precision"
            );
            DType::F16
        } else if matches!(device, Device::Cpu) {
            DType::F32
        } else {
            DType::F16
        };

        // Offload shapes device placement at load time; the candle backend
        // only distinguishes "everything on accelerator" from "stay on CPU".
        let device = if memory.sequential_cpu_offload {
            Device::Cpu
        } else {
            device
        };

        let pipeline = SdPipeline::load(&plan.weights_path, &device, dtype)?;
        Ok(Box::new(pipeline))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_detected_from_directory_name() {
        assert_eq!(
            SdVersion::detect(Path::new("/models/stable-diffusion-v1-5")),
            SdVersion::V1_5
        );
        assert_eq!(
            SdVersion::detect(Path::new("/models/stable-diffusion-2-1")),
            SdVersion::V2_1
        );
    }

    #[test]
    fn missing_components_surface_as_load_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = SdPipeline::load(dir.path(), &Device::Cpu, DType::F32).unwrap_err();
        assert!(matches!(err, ModelLoadError::Tokenizer(_)));
    }
}
