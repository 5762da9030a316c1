//! artforge_core - Core library for generation-request assembly
//!
//! This crate provides:
//! - Immutable settings snapshots read out of the host settings store
//! - Model identity, registry and name-based lookup
//! - Quantized-weight cache resolution and persistence
//! - The engine event bus and error taxonomy
//! - HuggingFace weight downloads

pub mod config;
pub mod downloaders;
pub mod error;
pub mod events;
pub mod models;
pub mod registry;
pub mod settings;
pub mod units;
pub mod weights;

pub use config::Config;
pub use error::ArtforgeError;
pub use events::{EngineEvent, ModelKind, ModelStatus, SignalBus};
pub use models::{ModelCategory, ModelIdentity, ModelSource, PipelineAction};
pub use registry::{ModelLookup, ModelRegistry};
pub use settings::{OperationMode, SettingsSnapshot, SettingsStore};
