//! JSON-persisted model registry and the name-based lookup service.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::ModelResolutionError;
use crate::models::{ModelIdentity, ModelSource};

/// Registry entry: the identity plus provenance bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredModel {
    pub identity: ModelIdentity,
    pub source: ModelSource,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub files: Vec<String>,
    pub registered_at: DateTime<Utc>,
}

/// The lookup surface request building needs. `ModelRegistry` is the real
/// implementation; tests substitute fixed maps.
pub trait ModelLookup: Send + Sync {
    fn resolve_by_name(&self, name: &str) -> Result<ModelIdentity, ModelResolutionError>;
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ModelRegistry {
    models: HashMap<String, RegisteredModel>,
    #[serde(skip)]
    registry_path: PathBuf,
}

impl ModelRegistry {
    /// Load from the default location, creating the base directory if needed.
    pub fn load() -> Result<Self> {
        let base_dir = Config::base_dir()?;
        fs::create_dir_all(&base_dir)?;
        Self::load_from(Config::registry_path()?)
    }

    /// Load from an explicit path. A missing file yields an empty registry.
    pub fn load_from(registry_path: PathBuf) -> Result<Self> {
        let mut registry = if registry_path.exists() {
            let content = fs::read_to_string(&registry_path)?;
            serde_json::from_str(&content)?
        } else {
            ModelRegistry::default()
        };
        registry.registry_path = registry_path;
        Ok(registry)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self)?;
        fs::write(&self.registry_path, content)?;
        Ok(())
    }

    pub fn add(&mut self, model: RegisteredModel) -> Result<()> {
        self.models.insert(model.identity.name.clone(), model);
        self.save()?;
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<Option<RegisteredModel>> {
        let removed = self.models.remove(name);
        self.save()?;
        Ok(removed)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredModel> {
        self.models.get(name)
    }

    pub fn list(&self) -> Vec<&RegisteredModel> {
        self.models.values().collect()
    }

    /// The default model for a category, if one is flagged.
    pub fn default_for<F>(&self, matches: F) -> Option<&RegisteredModel>
    where
        F: Fn(&ModelIdentity) -> bool,
    {
        self.models
            .values()
            .find(|m| m.identity.is_default && matches(&m.identity))
    }
}

impl ModelLookup for ModelRegistry {
    fn resolve_by_name(&self, name: &str) -> Result<ModelIdentity, ModelResolutionError> {
        if name.is_empty() {
            return Err(ModelResolutionError::MissingName);
        }
        let entry = self
            .models
            .get(name)
            .ok_or_else(|| ModelResolutionError::UnknownModel(name.to_string()))?;
        if !entry.identity.enabled {
            return Err(ModelResolutionError::Disabled {
                name: name.to_string(),
            });
        }
        Ok(entry.identity.clone())
    }
}

/// Total size of every weight file under a model directory, for registry
/// bookkeeping after a download completes.
pub fn dir_size_bytes(dir: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                total += dir_size_bytes(&path);
            } else if let Ok(meta) = entry.metadata() {
                total += meta.len();
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ModelCategory, PipelineAction};
    use tempfile::TempDir;

    fn entry(name: &str, enabled: bool) -> RegisteredModel {
        RegisteredModel {
            identity: ModelIdentity {
                name: name.into(),
                path: PathBuf::from(format!("/models/{name}")),
                branch: None,
                version: None,
                category: ModelCategory::StableDiffusion,
                pipeline_action: PipelineAction::Txt2Img,
                enabled,
                is_default: false,
            },
            source: ModelSource::Local,
            size_bytes: 0,
            files: vec![],
            registered_at: Utc::now(),
        }
    }

    #[test]
    fn roundtrips_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");

        let mut registry = ModelRegistry::load_from(path.clone()).unwrap();
        registry.add(entry("sd-v1-5", true)).unwrap();

        let reloaded = ModelRegistry::load_from(path).unwrap();
        assert_eq!(reloaded.list().len(), 1);
        assert!(reloaded.get("sd-v1-5").is_some());
    }

    #[test]
    fn resolve_by_name_errors() {
        let dir = TempDir::new().unwrap();
        let mut registry = ModelRegistry::load_from(dir.path().join("r.json")).unwrap();
        registry.add(entry("enabled-model", true)).unwrap();
        registry.add(entry("disabled-model", false)).unwrap();

        assert!(registry.resolve_by_name("enabled-model").is_ok());
        assert!(matches!(
            registry.resolve_by_name(""),
            Err(ModelResolutionError::MissingName)
        ));
        assert!(matches!(
            registry.resolve_by_name("missing"),
            Err(ModelResolutionError::UnknownModel(_))
        ));
        assert!(matches!(
            registry.resolve_by_name("disabled-model"),
            Err(ModelResolutionError::Disabled { .. })
        ));
    }
}
