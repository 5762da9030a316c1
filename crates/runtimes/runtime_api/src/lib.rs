//! artforge_runtime_api - Runtime traits and streaming types
//!
//! This crate defines the contract between the engine and its inference
//! runtimes. Each runtime (LLM, diffusion) implements these; the engine
//! drives them without knowing which backend is behind the trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use artforge_core::error::ModelLoadError;
use artforge_core::weights::QuantDtype;

pub use artforge_core::events::ModelStatus;

/// What a runtime can do.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct RuntimeCaps {
    pub chat: bool,
    pub images: bool,
    pub embeddings: bool,
    pub streaming: bool,
    pub tool_calls: bool,
}

/// Configuration for loading a model into a runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeLoadConfig {
    pub model_path: PathBuf,
    pub dtype: QuantDtype,
    #[serde(default)]
    pub gpu_id: Option<u32>,
    /// Adapters (LoRA-style) applied after the base load. An adapter failure
    /// never invalidates the base model.
    #[serde(default)]
    pub adapters: Vec<PathBuf>,
}

/// Chat message passed to an LLM runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Structured response formats a caller may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    Json,
}

/// One generation call against a loaded chat model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub messages: Vec<ChatMessage>,

    #[serde(default)]
    pub system_prompt_override: Option<String>,

    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_top_k")]
    pub top_k: u32,

    #[serde(default)]
    pub seed: Option<u64>,

    /// Vision inputs, for models that take them.
    #[serde(default)]
    pub images: Vec<PathBuf>,

    /// Force the model to call this tool.
    #[serde(default)]
    pub forced_tool: Option<String>,

    #[serde(default)]
    pub response_format: Option<ResponseFormat>,
}

fn default_max_new_tokens() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

fn default_top_k() -> u32 {
    40
}

impl Default for LlmRequest {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            system_prompt_override: None,
            max_new_tokens: default_max_new_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            seed: None,
            images: Vec::new(),
            forced_tool: None,
            response_format: None,
        }
    }
}

/// One streamed emission. Sequence numbers are strictly increasing per call
/// and exactly one event per call carries `is_end_of_message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEvent {
    pub request_id: u64,
    pub content: String,
    pub sequence: u64,
    pub is_first: bool,
    pub is_end_of_message: bool,
}

/// Why a generation call stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Interrupted,
    Error,
}

/// The normalized result every generation call returns, even on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOutcome {
    /// User-visible text, with tool syntax stripped.
    pub text: String,
    pub tokens_generated: usize,
    pub finish_reason: FinishReason,
    /// Names of tools the model invoked, for observability. Never part of
    /// the visible text.
    pub executed_tools: Vec<String>,
    /// Human-readable message for `FinishReason::Error` outcomes. The same
    /// text was already delivered through the streaming channel.
    pub error_message: Option<String>,
}

impl GenerationOutcome {
    pub fn empty(finish_reason: FinishReason) -> Self {
        Self {
            text: String::new(),
            tokens_generated: 0,
            finish_reason,
            executed_tools: Vec::new(),
            error_message: None,
        }
    }
}

/// Lifecycle surface every runtime exposes. Load failures are captured at
/// this boundary: implementations log the full chain, move the slot to
/// `Failed`, and report through status rather than panicking upward.
#[async_trait]
pub trait Runtime: Send + Sync {
    fn caps(&self) -> RuntimeCaps;

    fn status(&self) -> ModelStatus;

    /// Path of the currently-loaded model, if any. The engine compares this
    /// against the settings-configured path before each generation.
    fn loaded_path(&self) -> Option<PathBuf>;

    async fn load(&mut self, config: RuntimeLoadConfig) -> Result<(), ModelLoadError>;

    /// Safe to call on an already-unloaded slot.
    async fn unload(&mut self);
}

/// Chat prompt templating for models without a packaged chat template
/// (Llama-style tags).
pub fn build_chat_prompt(messages: &[ChatMessage], system_override: Option<&str>) -> String {
    let mut prompt = String::new();
    let mut system_emitted = false;

    if let Some(system) = system_override {
        prompt.push_str(&format!("<<SYS>>\n{}\n<</SYS>>\n\n", system));
        system_emitted = true;
    }

    for msg in messages {
        match msg.role.as_str() {
            "system" => {
                if !system_emitted {
                    prompt.push_str(&format!("<<SYS>>\n{}\n<</SYS>>\n\n", msg.content));
                    system_emitted = true;
                }
            }
            "user" => {
                prompt.push_str(&format!("[INST] {} [/INST]", msg.content));
            }
            "assistant" => {
                prompt.push_str(&format!(" {} ", msg.content));
            }
            _ => prompt.push_str(&msg.content),
        }
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_override_replaces_message_system() {
        let messages = vec![
            ChatMessage::system("stored system"),
            ChatMessage::user("hi"),
        ];
        let prompt = build_chat_prompt(&messages, Some("override"));
        assert!(prompt.contains("override"));
        assert!(!prompt.contains("stored system"));
        assert!(prompt.contains("[INST] hi [/INST]"));
    }

    #[test]
    fn request_defaults_are_sane() {
        let request: LlmRequest = serde_json::from_str(r#"{"messages": []}"#).unwrap();
        assert_eq!(request.max_new_tokens, 2048);
        assert_eq!(request.top_k, 40);
        assert!(request.forced_tool.is_none());
    }
}
