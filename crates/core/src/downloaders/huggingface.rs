//! HuggingFace weight downloads.
//!
//! A leaf utility: lists a repo, picks the artifact set a pipeline actually
//! needs, streams each file to disk with a progress bar, and reports the
//! result. Completion/failure is announced on the event bus so the resolver
//! can retry once weights exist.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use serde::Deserialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{DownloadedModel, Downloader};
use crate::events::{EngineEvent, SignalBus};
use crate::models::{ModelCategory, ModelIdentity, PipelineAction};

const HF_API_BASE: &str = "https://huggingface.co/api";
const HF_CDN_BASE: &str = "https://huggingface.co";

fn component_dir(rfilename: &str) -> PathBuf {
    Path::new(rfilename)
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .to_path_buf()
}

pub struct HuggingFaceDownloader {
    client: Client,
    storage_dir: PathBuf,
    bus: Option<SignalBus>,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HfModelInfo {
    pub id: String,
    #[serde(default)]
    pub pipeline_tag: Option<String>,
    #[serde(default)]
    pub siblings: Vec<HfSibling>,
}

#[derive(Debug, Deserialize)]
pub struct HfSibling {
    pub rfilename: String,
    #[serde(default)]
    pub size: Option<u64>,
}

impl HuggingFaceDownloader {
    pub fn new(storage_dir: PathBuf, bus: Option<SignalBus>, token: Option<String>) -> Result<Self> {
        Ok(Self {
            client: Client::builder()
                .user_agent("artforge/1.0")
                .build()
                .context("Failed to create HTTP client")?,
            storage_dir,
            bus,
            token,
        })
    }

    pub async fn model_info(&self, repo_id: &str) -> Result<HfModelInfo> {
        let url = format!("{}/models/{}", HF_API_BASE, repo_id);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.context("Failed to fetch model info")?;
        if !response.status().is_success() {
            anyhow::bail!("Model '{}' not found on HuggingFace", repo_id);
        }
        Ok(response.json().await?)
    }

    /// Pick the files a load actually needs. Diffusers repos keep their
    /// components in subdirectories and carry a `model_index.json`;
    /// transformer repos are flat. Either way configs and tokenizers come
    /// along, and `.bin` weights are only taken for components with no
    /// safetensors alternative.
    fn select_files(info: &HfModelInfo, requested: Option<&str>) -> Vec<String> {
        if let Some(file) = requested {
            return vec![file.to_string()];
        }

        let wanted_metadata = |name: &str| {
            name.ends_with("config.json")
                || name.ends_with("model_index.json")
                || name.ends_with("tokenizer.json")
                || name.ends_with("tokenizer_config.json")
                || name.ends_with("scheduler_config.json")
                || name.ends_with("special_tokens_map.json")
        };

        let mut files: Vec<String> = info
            .siblings
            .iter()
            .map(|s| s.rfilename.clone())
            .filter(|name| wanted_metadata(name) || name.ends_with(".safetensors"))
            .collect();

        // Fall back to .bin weights only for components that ship nothing else.
        let safetensor_dirs: std::collections::HashSet<PathBuf> = files
            .iter()
            .filter(|f| f.ends_with(".safetensors"))
            .map(|f| component_dir(f))
            .collect();
        for sibling in &info.siblings {
            if sibling.rfilename.ends_with(".bin")
                && !safetensor_dirs.contains(&component_dir(&sibling.rfilename))
            {
                files.push(sibling.rfilename.clone());
            }
        }

        files
    }

    async fn fetch_file(&self, repo_id: &str, rfilename: &str, target_dir: &Path) -> Result<u64> {
        let url = format!("{}/{}/resolve/main/{}", HF_CDN_BASE, repo_id, rfilename);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to request {rfilename}"))?;
        if !response.status().is_success() {
            anyhow::bail!("Download of '{}' failed: HTTP {}", rfilename, response.status());
        }

        let total = response.content_length().unwrap_or(0);
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::with_template(
                "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.set_message(rfilename.to_string());

        let target = target_dir.join(rfilename);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&target)
            .with_context(|| format!("Failed to create {}", target.display()))?;

        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Download stream error")?;
            file.write_all(&chunk)?;
            written += chunk.len() as u64;
            bar.set_position(written);
        }
        bar.finish_and_clear();
        Ok(written)
    }

    fn identity_for(info: &HfModelInfo, path: &Path) -> ModelIdentity {
        let category = info
            .pipeline_tag
            .as_deref()
            .map(ModelCategory::from_pipeline_tag)
            .unwrap_or(ModelCategory::Unknown);
        let pipeline_action = match category {
            ModelCategory::Llm => PipelineAction::Chat,
            ModelCategory::Embedding => PipelineAction::Embedding,
            _ => PipelineAction::Txt2Img,
        };
        ModelIdentity {
            name: info.id.clone(),
            path: path.to_path_buf(),
            branch: Some("main".to_string()),
            version: None,
            category,
            pipeline_action,
            enabled: true,
            is_default: false,
        }
    }
}

#[async_trait]
impl Downloader for HuggingFaceDownloader {
    async fn download(&self, repo_id: &str, file: Option<&str>) -> Result<DownloadedModel> {
        let result = self.download_inner(repo_id, file).await;
        if let Some(bus) = &self.bus {
            match &result {
                Ok(model) => bus.emit(EngineEvent::DownloadComplete {
                    repo_id: repo_id.to_string(),
                    path: model.path.clone(),
                }),
                Err(e) => bus.emit(EngineEvent::DownloadFailed {
                    repo_id: repo_id.to_string(),
                    message: e.to_string(),
                }),
            }
        }
        result
    }
}

impl HuggingFaceDownloader {
    async fn download_inner(&self, repo_id: &str, file: Option<&str>) -> Result<DownloadedModel> {
        let info = self.model_info(repo_id).await?;
        let files = Self::select_files(&info, file);
        if files.is_empty() {
            anyhow::bail!("Repo '{}' has no loadable weight files", repo_id);
        }

        let target_dir = self.storage_dir.join(repo_id.replace('/', "--"));
        fs::create_dir_all(&target_dir)?;

        tracing::info!(repo = repo_id, files = files.len(), "downloading model");
        let mut size_bytes = 0;
        for rfilename in &files {
            size_bytes += self.fetch_file(repo_id, rfilename, &target_dir).await?;
        }

        Ok(DownloadedModel {
            identity: Self::identity_for(&info, &target_dir),
            path: target_dir,
            files,
            size_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(siblings: &[&str], tag: Option<&str>) -> HfModelInfo {
        HfModelInfo {
            id: "acme/model".into(),
            pipeline_tag: tag.map(String::from),
            siblings: siblings
                .iter()
                .map(|s| HfSibling {
                    rfilename: s.to_string(),
                    size: None,
                })
                .collect(),
        }
    }

    #[test]
    fn explicit_file_request_wins() {
        let info = info(&["a.safetensors", "b.safetensors"], None);
        let files = HuggingFaceDownloader::select_files(&info, Some("b.safetensors"));
        assert_eq!(files, vec!["b.safetensors".to_string()]);
    }

    #[test]
    fn diffusers_layout_keeps_components_and_index() {
        let info = info(
            &[
                "model_index.json",
                "unet/config.json",
                "unet/diffusion_pytorch_model.safetensors",
                "vae/config.json",
                "vae/diffusion_pytorch_model.bin",
                "text_encoder/model.safetensors",
                "tokenizer/tokenizer.json",
                "README.md",
            ],
            Some("text-to-image"),
        );
        let files = HuggingFaceDownloader::select_files(&info, None);
        assert!(files.contains(&"model_index.json".to_string()));
        assert!(files.contains(&"unet/diffusion_pytorch_model.safetensors".to_string()));
        // The VAE only ships .bin, so the .bin is taken.
        assert!(files.contains(&"vae/diffusion_pytorch_model.bin".to_string()));
        assert!(!files.iter().any(|f| f == "README.md"));
    }

    #[test]
    fn bin_skipped_when_safetensors_exists_in_same_component() {
        let info = info(
            &["config.json", "model.safetensors", "pytorch_model.bin"],
            Some("text-generation"),
        );
        let files = HuggingFaceDownloader::select_files(&info, None);
        assert!(files.contains(&"model.safetensors".to_string()));
        assert!(!files.contains(&"pytorch_model.bin".to_string()));
    }

    #[test]
    fn identity_classifies_from_pipeline_tag() {
        let info = info(&["config.json"], Some("text-generation"));
        let identity = HuggingFaceDownloader::identity_for(&info, Path::new("/m"));
        assert_eq!(identity.category, ModelCategory::Llm);
        assert_eq!(identity.pipeline_action, PipelineAction::Chat);
    }
}
