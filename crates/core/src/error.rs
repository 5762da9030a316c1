//! Error taxonomy for the engine.
//!
//! Errors raised before committing to a long-running operation (resolution,
//! validation) propagate to the immediate caller. Errors inside a streaming
//! operation never do: they are normalized into the streaming channel by the
//! orchestrator so already-delivered partial output is not contradicted by a
//! crash. Every fatal path ends in a human-readable message; full chains go
//! to the logs.

use std::path::PathBuf;
use thiserror::Error;

/// Umbrella error for callers that do not care which stage failed.
#[derive(Debug, Error)]
pub enum ArtforgeError {
    #[error(transparent)]
    ModelResolution(#[from] ModelResolutionError),

    #[error(transparent)]
    UnsupportedOperation(#[from] UnsupportedOperationError),

    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Quantization(#[from] QuantizationUnavailableError),

    #[error(transparent)]
    ConfigPatch(#[from] ConfigPatchFailure),
}

/// Cannot determine which weights/model to use. Not retried.
#[derive(Debug, Error)]
pub enum ModelResolutionError {
    #[error("no model name given and none configured in settings")]
    MissingName,

    #[error("model '{0}' not found in the registry")]
    UnknownModel(String),

    #[error("model '{name}' is disabled")]
    Disabled { name: String },

    #[error("weights missing at {0}")]
    WeightsMissing(PathBuf),

    #[error("model lookup failed: {0}")]
    LookupFailed(String),
}

/// The requested operation does not map to a known pipeline. Fatal to the
/// call, not retried.
#[derive(Debug, Error)]
pub enum UnsupportedOperationError {
    #[error("unknown operation section '{section}'")]
    UnknownSection { section: String },

    #[error("unknown scheduler '{scheduler}'")]
    UnknownScheduler { scheduler: String },

    #[error("operation '{mode}' requires '{input}' but none was supplied")]
    MissingInput { mode: String, input: String },
}

/// Failure during weight load, quantization or device placement. Captured at
/// the lifecycle boundary; the slot transitions to `Failed` and the caller is
/// notified via a status event rather than an exception.
#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("io error while loading model: {0}")]
    Io(#[from] std::io::Error),

    #[error("model config at {path} is invalid: {reason}")]
    InvalidConfig { path: PathBuf, reason: String },

    #[error("'{path}' is not a usable chat model: {reason}")]
    NotAChatModel { path: PathBuf, reason: String },

    #[error("failed to load weights from {path}: {reason}")]
    Weights { path: PathBuf, reason: String },

    #[error("device placement failed: {0}")]
    Device(String),

    #[error("adapter load failed for {path}: {reason}")]
    Adapter { path: PathBuf, reason: String },

    #[error("tokenizer load failed: {0}")]
    Tokenizer(String),
}

/// Failure during the inference call itself. Always converted into a single
/// synthetic error message on the streaming channel.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("model is not loaded")]
    NotLoaded,

    #[error("generation failed: {0}")]
    Inference(String),

    #[error("tool call payload is not valid JSON: {0}")]
    MalformedToolCall(String),

    #[error("input image is unusable: {0}")]
    BadImage(String),

    #[error("request references an unresolved canvas image")]
    UnresolvedCanvasImage,
}

/// Quantization backend missing or misconfigured. Advisory: the caller falls
/// back to full precision with a warning.
#[derive(Debug, Error)]
#[error("quantization to {dtype} unavailable: {reason}")]
pub struct QuantizationUnavailableError {
    pub dtype: String,
    pub reason: String,
}

/// A known-bad model config could not be auto-fixed. Advisory: the load
/// proceeds and any real failure surfaces as [`ModelLoadError`].
#[derive(Debug, Error)]
#[error("could not patch {path}: {reason}")]
pub struct ConfigPatchFailure {
    pub path: PathBuf,
    pub reason: String,
}
