pub mod huggingface;

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;

use crate::models::ModelIdentity;

/// Outcome of a completed download.
#[derive(Debug, Clone)]
pub struct DownloadedModel {
    pub identity: ModelIdentity,
    pub path: PathBuf,
    pub files: Vec<String>,
    pub size_bytes: u64,
}

/// Weight-fetching service. Resolution treats missing weights as a trigger
/// to call this, then retries once the completion event fires.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, repo_id: &str, file: Option<&str>) -> Result<DownloadedModel>;
}

pub use huggingface::HuggingFaceDownloader;
