//! Generation orchestration: one call at a time, streamed to a single-slot
//! callback, cooperatively interruptible, with every failure normalized into
//! the streaming channel.
//!
//! Per-call state machine: `Idle -> Streaming -> {Completed | Interrupted |
//! Errored}` and back to `Idle` through a cleanup step (callback cleared,
//! interrupt flag reset) that runs on every exit path.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use artforge_core::error::GenerationError;
use artforge_runtime_api::{
    build_chat_prompt, FinishReason, GenerationOutcome, LlmRequest, ResponseFormat, TokenEvent,
};

use crate::model::{StreamFinish, StreamOutcome};
use crate::sampling::SamplingParams;

const TOOL_CALL_OPEN: &str = "<tool_call>";
const TOOL_CALL_CLOSE: &str = "</tool_call>";
const ACTION_MARKER: &str = "\nAction:";

/// Streaming surface the orchestrator drives. [`crate::model::LoadedModel`]
/// is the production implementation; tests script their own.
pub trait TokenStreamer: Send + Sync {
    fn context_len(&self) -> usize;

    fn generate_stream(
        &self,
        prompt: &str,
        params: &SamplingParams,
        interrupt: &AtomicBool,
        on_delta: &mut dyn FnMut(&str) -> bool,
    ) -> Result<StreamOutcome, GenerationError>;
}

impl TokenStreamer for crate::model::LoadedModel {
    fn context_len(&self) -> usize {
        self.context_len()
    }

    fn generate_stream(
        &self,
        prompt: &str,
        params: &SamplingParams,
        interrupt: &AtomicBool,
        on_delta: &mut dyn FnMut(&str) -> bool,
    ) -> Result<StreamOutcome, GenerationError> {
        crate::model::LoadedModel::generate_stream(self, prompt, params, interrupt, on_delta)
    }
}

pub type TokenCallback = Box<dyn FnMut(TokenEvent) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Idle,
    Streaming,
}

/// Emits events with strictly increasing sequence numbers and guarantees
/// exactly one terminal event per call.
struct Emitter {
    callback: Option<TokenCallback>,
    request_id: u64,
    sequence: u64,
}

impl Emitter {
    fn emit(&mut self, content: String, is_end_of_message: bool) {
        let event = TokenEvent {
            request_id: self.request_id,
            content,
            sequence: self.sequence,
            is_first: self.sequence == 0,
            is_end_of_message,
        };
        self.sequence += 1;
        if let Some(callback) = &mut self.callback {
            callback(event);
        }
    }
}

pub struct GenerationOrchestrator {
    callback: Option<TokenCallback>,
    interrupt: Arc<AtomicBool>,
    state: CallState,
}

impl Default for GenerationOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationOrchestrator {
    pub fn new() -> Self {
        Self {
            callback: None,
            interrupt: Arc::new(AtomicBool::new(false)),
            state: CallState::Idle,
        }
    }

    /// Install the single-slot streaming callback for the next call.
    pub fn set_callback(&mut self, callback: TokenCallback) {
        self.callback = Some(callback);
    }

    /// Handle for requesting cancellation from another thread. The flag is
    /// honored at each streaming step and reset when the call finishes.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    pub fn is_streaming(&self) -> bool {
        self.state == CallState::Streaming
    }

    /// Run one generation call. Never returns an error: failures are logged,
    /// converted into a synthetic error message on the streaming channel,
    /// and reported in the outcome. Cleanup (callback cleared, interrupt
    /// reset) runs regardless of how the call ends.
    pub fn run(
        &mut self,
        model: &dyn TokenStreamer,
        request_id: u64,
        request: &LlmRequest,
    ) -> GenerationOutcome {
        self.state = CallState::Streaming;
        let mut emitter = Emitter {
            callback: self.callback.take(),
            request_id,
            sequence: 0,
        };

        let result = self.run_inner(model, request, &mut emitter);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(request_id, error = ?e, "generation failed");
                let message = format!("Generation failed: {e}");
                emitter.emit(message.clone(), false);
                let mut outcome = GenerationOutcome::empty(FinishReason::Error);
                outcome.error_message = Some(message);
                outcome
            }
        };

        // Exactly one terminal event per call, carrying no visible text.
        emitter.emit(String::new(), true);

        // Guaranteed-release cleanup.
        self.interrupt.store(false, Ordering::SeqCst);
        self.callback = None;
        self.state = CallState::Idle;

        outcome
    }

    fn run_inner(
        &self,
        model: &dyn TokenStreamer,
        request: &LlmRequest,
        emitter: &mut Emitter,
    ) -> Result<GenerationOutcome, GenerationError> {
        let prompt = assemble_prompt(request);

        let context_len = model.context_len();
        let mut max_new_tokens = request.max_new_tokens as usize;
        if max_new_tokens > context_len {
            tracing::warn!(
                requested = max_new_tokens,
                context_len,
                "max_new_tokens exceeds model context; clamping"
            );
            max_new_tokens = context_len;
        }

        let params = SamplingParams {
            max_new_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k as usize,
            seed: request.seed.unwrap_or(42),
        };

        let stream = model.generate_stream(&prompt, &params, &self.interrupt, &mut |delta| {
            emitter.emit(delta.to_string(), false);
            true
        })?;

        let (visible, executed_tools) = extract_tool_calls(&stream.text)?;
        let visible = truncate_at_action_marker(&visible).to_string();

        Ok(GenerationOutcome {
            text: visible,
            tokens_generated: stream.tokens_generated,
            finish_reason: match stream.finish {
                StreamFinish::Stop => FinishReason::Stop,
                StreamFinish::Length => FinishReason::Length,
                StreamFinish::Interrupted | StreamFinish::Disconnected => {
                    FinishReason::Interrupted
                }
            },
            executed_tools,
            error_message: None,
        })
    }
}

/// Workflow context assembly: system prompt override plus per-call
/// constraints expressed as system-level instructions.
fn assemble_prompt(request: &LlmRequest) -> String {
    let mut system = request.system_prompt_override.clone();

    let mut constraints = Vec::new();
    if request.response_format == Some(ResponseFormat::Json) {
        constraints.push("Respond with a single valid JSON object and nothing else.".to_string());
    }
    if let Some(tool) = &request.forced_tool {
        constraints.push(format!("You must call the '{tool}' tool to answer."));
    }
    if !constraints.is_empty() {
        let extra = constraints.join(" ");
        system = Some(match system {
            Some(s) => format!("{s}\n{extra}"),
            None => extra,
        });
    }

    build_chat_prompt(&request.messages, system.as_deref())
}

/// Split tool-invocation segments out of the raw model output. Tool syntax
/// never reaches the visible text; invoked tool names are preserved for
/// observability. Malformed payloads are a generation error.
fn extract_tool_calls(text: &str) -> Result<(String, Vec<String>), GenerationError> {
    let mut visible = String::new();
    let mut tools = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find(TOOL_CALL_OPEN) {
        visible.push_str(&rest[..start]);
        let after = &rest[start + TOOL_CALL_OPEN.len()..];
        let end = after.find(TOOL_CALL_CLOSE).ok_or_else(|| {
            GenerationError::MalformedToolCall("unterminated tool call block".to_string())
        })?;
        let payload: Value = serde_json::from_str(after[..end].trim())
            .map_err(|e| GenerationError::MalformedToolCall(e.to_string()))?;
        let name = payload
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                GenerationError::MalformedToolCall("tool call has no 'name' field".to_string())
            })?;
        tools.push(name.to_string());
        rest = &after[end + TOOL_CALL_CLOSE.len()..];
    }
    visible.push_str(rest);
    Ok((visible.trim().to_string(), tools))
}

/// ReAct-style transcripts put tool syntax after an `Action:` marker; the
/// visible content stops there.
fn truncate_at_action_marker(text: &str) -> &str {
    match text.find(ACTION_MARKER) {
        Some(pos) => text[..pos].trim_end(),
        None => text,
    }
}
