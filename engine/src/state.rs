//! Engine state: per-handler model slots behind their worker queues, wired
//! to the settings store, registry and event bus.
//!
//! The GUI (or any host) never blocks on a load or a generation: it submits
//! commands and observes `EngineEvent`s. Each handler kind owns exactly one
//! model slot; submitting work for a different model path than the loaded
//! one reloads transparently.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::oneshot;

use artforge_core::config::Config;
use artforge_core::downloaders::Downloader;
use artforge_core::events::{EngineEvent, ModelKind, SignalBus};
use artforge_core::models::ModelSource;
use artforge_core::registry::{ModelLookup, ModelRegistry, RegisteredModel};
use artforge_core::settings::SettingsStore;
use artforge_core::weights::QuantDtype;
use artforge_runtime_api::{
    FinishReason, GenerationOutcome, LlmRequest, Runtime, RuntimeLoadConfig,
};
use artforge_runtime_diffusion::pipeline::CandleSdLoader;
use artforge_runtime_diffusion::{
    BuildOverrides, GeneratedImage, PipelineSlot, RequestBuilder, VramProbe,
};
use artforge_runtime_llm::{ContextPolicy, GenerationOrchestrator, LlmRuntime};

use crate::worker::Worker;

/// Commands the diffusion worker processes in FIFO order.
pub enum DiffusionCommand {
    Generate {
        request_id: u64,
        overrides: BuildOverrides,
        reply: Option<oneshot::Sender<Result<GeneratedImage, String>>>,
    },
    Load {
        name: String,
        dtype: QuantDtype,
    },
    Unload,
}

/// Commands the chat worker processes in FIFO order.
pub enum ChatCommand {
    Generate {
        request_id: u64,
        request: LlmRequest,
        reply: Option<oneshot::Sender<GenerationOutcome>>,
    },
    Load {
        name: String,
    },
    Unload,
}

/// VRAM detection. Candle exposes no portable total-memory query, so the
/// deployment pins it via `ARTFORGE_VRAM_GB`; unset means unknown, which the
/// tier planner treats as the smallest tier.
struct EnvVramProbe;

impl VramProbe for EnvVramProbe {
    fn total_vram_gb(&self) -> Option<f64> {
        std::env::var("ARTFORGE_VRAM_GB")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
    }
}

pub struct Engine {
    bus: SignalBus,
    store: Arc<dyn SettingsStore>,
    registry: Arc<RwLock<ModelRegistry>>,
    diffusion: Worker<DiffusionCommand>,
    chat: Worker<ChatCommand>,
    llm_interrupt: Arc<AtomicBool>,
    next_request_id: AtomicU64,
}

impl Engine {
    pub fn new(config: Config, store: Arc<dyn SettingsStore>, registry: ModelRegistry) -> Self {
        let bus = SignalBus::default();
        let registry = Arc::new(RwLock::new(registry));

        let diffusion = Self::spawn_diffusion_worker(
            &config,
            store.clone(),
            registry.clone(),
            bus.clone(),
        );

        let orchestrator = GenerationOrchestrator::new();
        let llm_interrupt = orchestrator.interrupt_handle();
        let chat = Self::spawn_chat_worker(
            &config,
            store.clone(),
            registry.clone(),
            bus.clone(),
            orchestrator,
        );

        Self {
            bus,
            store,
            registry,
            diffusion,
            chat,
            llm_interrupt,
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Hook up the weight-download service: `DownloadRequested` events fetch
    /// the missing weights, register them, and retry the load that asked.
    pub fn attach_downloader(&self, downloader: Arc<dyn Downloader>) {
        let mut events = self.bus.subscribe();
        let registry = self.registry.clone();
        let store = self.store.clone();
        let diffusion = self.diffusion.clone();
        let chat = self.chat.clone();

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let EngineEvent::DownloadRequested { kind, name } = event else {
                    continue;
                };

                tracing::info!(model = name, "fetching missing weights");
                match downloader.download(&name, None).await {
                    Ok(downloaded) => {
                        {
                            let mut registry =
                                registry.write().unwrap_or_else(|e| e.into_inner());
                            let mut identity = downloaded.identity.clone();
                            identity.name = name.clone();
                            let _ = registry.add(RegisteredModel {
                                identity,
                                source: ModelSource::HuggingFace {
                                    repo_id: downloaded.identity.name.clone(),
                                },
                                size_bytes: downloaded.size_bytes,
                                files: downloaded.files.clone(),
                                registered_at: chrono::Utc::now(),
                            });
                        }
                        // Retry the load now that weights exist.
                        match kind {
                            ModelKind::Diffusion => {
                                let dtype = store.snapshot().generator.dtype;
                                diffusion
                                    .submit(DiffusionCommand::Load { name, dtype })
                                    .await;
                            }
                            ModelKind::Llm | ModelKind::VisionAgent => {
                                chat.submit(ChatCommand::Load { name }).await;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(model = name, error = %e, "weight download failed");
                    }
                }
            }
        });
    }

    pub fn bus(&self) -> SignalBus {
        self.bus.clone()
    }

    pub fn registry(&self) -> Arc<RwLock<ModelRegistry>> {
        self.registry.clone()
    }

    fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue an image generation. Returns the request id (for correlating
    /// bus events) and a receiver for the finished image.
    pub async fn generate_image(
        &self,
        overrides: BuildOverrides,
    ) -> (u64, oneshot::Receiver<Result<GeneratedImage, String>>) {
        let request_id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.diffusion
            .submit(DiffusionCommand::Generate {
                request_id,
                overrides,
                reply: Some(tx),
            })
            .await;
        (request_id, rx)
    }

    /// Queue a chat generation. Tokens arrive on the bus as they stream; the
    /// receiver resolves with the normalized outcome.
    pub async fn chat(&self, request: LlmRequest) -> (u64, oneshot::Receiver<GenerationOutcome>) {
        let request_id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.chat
            .submit(ChatCommand::Generate {
                request_id,
                request,
                reply: Some(tx),
            })
            .await;
        (request_id, rx)
    }

    pub async fn load_diffusion_model(&self, name: impl Into<String>, dtype: QuantDtype) {
        self.diffusion
            .submit(DiffusionCommand::Load {
                name: name.into(),
                dtype,
            })
            .await;
    }

    pub async fn unload_diffusion_model(&self) {
        self.diffusion.submit(DiffusionCommand::Unload).await;
    }

    pub async fn load_chat_model(&self, name: impl Into<String>) {
        self.chat.submit(ChatCommand::Load { name: name.into() }).await;
    }

    pub async fn unload_chat_model(&self) {
        self.chat.submit(ChatCommand::Unload).await;
    }

    /// Cancel chat work: queued requests are dropped and the in-flight
    /// stream stops at its next step boundary.
    pub fn interrupt_chat(&self) {
        self.chat.interrupt();
        self.llm_interrupt.store(true, Ordering::SeqCst);
    }

    /// Cancel queued diffusion work. The in-flight denoise run completes;
    /// diffusion calls are not interruptible mid-step.
    pub fn interrupt_diffusion(&self) {
        self.diffusion.interrupt();
    }

    fn spawn_diffusion_worker(
        config: &Config,
        store: Arc<dyn SettingsStore>,
        registry: Arc<RwLock<ModelRegistry>>,
        bus: SignalBus,
    ) -> Worker<DiffusionCommand> {
        let mut slot = PipelineSlot::new(
            Box::new(CandleSdLoader),
            Box::new(EnvVramProbe),
            config.vram,
            bus.clone(),
        );

        Worker::spawn("diffusion", move |command, _flag| match command {
            DiffusionCommand::Generate {
                request_id,
                overrides,
                reply,
            } => {
                let snapshot = store.snapshot();
                let result = {
                    let registry = registry.read().unwrap_or_else(|e| e.into_inner());
                    RequestBuilder::new(&*registry).build(&snapshot, overrides)
                };

                let result = result.map_err(|e| e.to_string()).and_then(|bundle| {
                    if !bundle.model.path.exists() {
                        bus.emit(EngineEvent::DownloadRequested {
                            kind: ModelKind::Diffusion,
                            name: bundle.model.name.clone(),
                        });
                        return Err(format!(
                            "weights for '{}' are not downloaded yet",
                            bundle.model.name
                        ));
                    }
                    let dtype = snapshot.generator.dtype;
                    slot.ensure_loaded(&bundle.model, dtype, &snapshot.memory);
                    slot.generate(&bundle).map_err(|e| e.to_string())
                });

                match &result {
                    Ok(image) => bus.emit(EngineEvent::ImageGenerated {
                        request_id,
                        width: image.width,
                        height: image.height,
                    }),
                    Err(message) => {
                        tracing::error!(request_id, message, "image generation failed");
                        bus.emit(EngineEvent::GenerationError {
                            request_id,
                            message: message.clone(),
                        });
                    }
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            DiffusionCommand::Load { name, dtype } => {
                let snapshot = store.snapshot();
                let identity = {
                    let registry = registry.read().unwrap_or_else(|e| e.into_inner());
                    registry.resolve_by_name(&name)
                };
                match identity {
                    Ok(identity) if !identity.path.exists() => {
                        tracing::info!(model = name, "weights missing, requesting download");
                        bus.emit(EngineEvent::DownloadRequested {
                            kind: ModelKind::Diffusion,
                            name,
                        });
                    }
                    Ok(identity) => {
                        slot.load(&identity, dtype, &snapshot.memory, &[]);
                    }
                    Err(e) => tracing::error!(model = name, error = %e, "cannot load model"),
                }
            }
            DiffusionCommand::Unload => slot.unload(),
        })
    }

    fn spawn_chat_worker(
        config: &Config,
        store: Arc<dyn SettingsStore>,
        registry: Arc<RwLock<ModelRegistry>>,
        bus: SignalBus,
        mut orchestrator: GenerationOrchestrator,
    ) -> Worker<ChatCommand> {
        let mut runtime = LlmRuntime::new(
            ContextPolicy {
                target_context_len: config.context.target_context_len,
                allow_rope_scaling: config.context.allow_rope_scaling,
            },
            bus.clone(),
        );

        Worker::spawn("chat", move |command, _flag| match command {
            ChatCommand::Generate {
                request_id,
                request,
                reply,
            } => {
                let snapshot = store.snapshot();
                let identity = {
                    let registry = registry.read().unwrap_or_else(|e| e.into_inner());
                    registry.resolve_by_name(&snapshot.llm.model)
                };

                let model = identity.map_err(|e| e.to_string()).and_then(|identity| {
                    // Path-mismatch guard: settings changes take effect here
                    // without the caller orchestrating a reload.
                    let mismatch = runtime.loaded_path().as_deref()
                        != Some(identity.path.as_path());
                    if mismatch
                        || runtime.status() != artforge_core::events::ModelStatus::Loaded
                    {
                        runtime
                            .load_sync(RuntimeLoadConfig {
                                model_path: identity.path.clone(),
                                dtype: snapshot.llm.dtype,
                                gpu_id: None,
                                adapters: vec![],
                            })
                            .map_err(|e| e.to_string())?;
                    }
                    runtime.model().ok_or_else(|| "chat model unavailable".to_string())
                });

                let outcome = match model {
                    Ok(model) => {
                        let stream_bus = bus.clone();
                        orchestrator.set_callback(Box::new(move |event| {
                            stream_bus.emit(EngineEvent::TokenStreamed {
                                request_id: event.request_id,
                                content: event.content,
                                sequence: event.sequence,
                                is_first: event.is_first,
                                is_end_of_message: event.is_end_of_message,
                            });
                        }));
                        orchestrator.run(model.as_ref(), request_id, &request)
                    }
                    Err(message) => {
                        tracing::error!(request_id, message, "chat request rejected");
                        let mut outcome = GenerationOutcome::empty(FinishReason::Error);
                        outcome.error_message = Some(message);
                        outcome
                    }
                };

                if let Some(message) = &outcome.error_message {
                    bus.emit(EngineEvent::GenerationError {
                        request_id,
                        message: message.clone(),
                    });
                }
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            ChatCommand::Load { name } => {
                let snapshot = store.snapshot();
                let identity = {
                    let registry = registry.read().unwrap_or_else(|e| e.into_inner());
                    registry.resolve_by_name(&name)
                };
                match identity {
                    Ok(identity) if !identity.path.exists() => {
                        tracing::info!(model = name, "weights missing, requesting download");
                        bus.emit(EngineEvent::DownloadRequested {
                            kind: ModelKind::Llm,
                            name,
                        });
                    }
                    Ok(identity) => {
                        if let Err(e) = runtime.load_sync(RuntimeLoadConfig {
                            model_path: identity.path,
                            dtype: snapshot.llm.dtype,
                            gpu_id: None,
                            adapters: vec![],
                        }) {
                            tracing::error!(model = name, error = %e, "chat model load failed");
                        }
                    }
                    Err(e) => tracing::error!(model = name, error = %e, "cannot load model"),
                }
            }
            ChatCommand::Unload => runtime.unload_sync(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use artforge_core::settings::{InMemorySettingsStore, SettingsSnapshot};
    use artforge_runtime_api::ChatMessage;

    fn engine_with_empty_registry() -> Engine {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = ModelRegistry::load_from(dir.path().join("registry.json")).unwrap();
        let store = Arc::new(InMemorySettingsStore::new(SettingsSnapshot::default()));
        Engine::new(Config::default(), store, registry)
    }

    #[tokio::test]
    async fn chat_without_configured_model_yields_error_outcome() {
        let engine = engine_with_empty_registry();
        let request = LlmRequest {
            messages: vec![ChatMessage::user("hello")],
            ..Default::default()
        };

        let (request_id, rx) = engine.chat(request).await;
        assert!(request_id >= 1);

        let outcome = rx.await.unwrap();
        assert_eq!(outcome.finish_reason, FinishReason::Error);
        assert!(outcome.error_message.is_some());
    }

    #[tokio::test]
    async fn image_generation_with_unknown_model_reports_resolution_error() {
        let engine = engine_with_empty_registry();
        let mut events = engine.bus().subscribe();

        let (request_id, rx) = engine.generate_image(BuildOverrides::default()).await;
        let result = rx.await.unwrap();
        assert!(result.is_err());

        // The same failure is visible on the bus.
        loop {
            match events.recv().await.unwrap() {
                EngineEvent::GenerationError {
                    request_id: id, ..
                } if id == request_id => break,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn request_ids_are_unique_and_increasing() {
        let engine = engine_with_empty_registry();
        let (a, _rx_a) = engine.chat(LlmRequest::default()).await;
        let (b, _rx_b) = engine.chat(LlmRequest::default()).await;
        assert!(b > a);
    }

    #[tokio::test]
    async fn missing_weights_trigger_download_and_load_retry() {
        use artforge_core::downloaders::{DownloadedModel, Downloader};
        use artforge_core::models::{ModelCategory, ModelIdentity, PipelineAction};
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct MockDownloader {
            target: std::path::PathBuf,
            calls: Arc<AtomicUsize>,
        }

        #[async_trait::async_trait]
        impl Downloader for MockDownloader {
            async fn download(
                &self,
                repo_id: &str,
                _file: Option<&str>,
            ) -> anyhow::Result<DownloadedModel> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                std::fs::create_dir_all(&self.target)?;
                Ok(DownloadedModel {
                    identity: ModelIdentity {
                        name: repo_id.to_string(),
                        path: self.target.clone(),
                        branch: Some("main".into()),
                        version: None,
                        category: ModelCategory::Llm,
                        pipeline_action: PipelineAction::Chat,
                        enabled: true,
                        is_default: false,
                    },
                    path: self.target.clone(),
                    files: vec!["config.json".into()],
                    size_bytes: 1,
                })
            }
        }

        let dir = tempfile::TempDir::new().unwrap();
        let weights_dir = dir.path().join("weights");
        let mut registry = ModelRegistry::load_from(dir.path().join("registry.json")).unwrap();
        registry
            .add(RegisteredModel {
                identity: ModelIdentity {
                    name: "tiny-chat".into(),
                    path: weights_dir.clone(),
                    branch: None,
                    version: None,
                    category: ModelCategory::Llm,
                    pipeline_action: PipelineAction::Chat,
                    enabled: true,
                    is_default: false,
                },
                source: ModelSource::Local,
                size_bytes: 0,
                files: vec![],
                registered_at: chrono::Utc::now(),
            })
            .unwrap();

        let store = Arc::new(InMemorySettingsStore::new(SettingsSnapshot::default()));
        let engine = Engine::new(Config::default(), store, registry);

        let calls = Arc::new(AtomicUsize::new(0));
        engine.attach_downloader(Arc::new(MockDownloader {
            target: weights_dir.clone(),
            calls: calls.clone(),
        }));

        let mut events = engine.bus().subscribe();
        engine.load_chat_model("tiny-chat").await;

        // The load notices the missing weights and asks for a download.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            let event = tokio::time::timeout_at(deadline, events.recv())
                .await
                .expect("timed out waiting for download request")
                .unwrap();
            if matches!(event, EngineEvent::DownloadRequested { .. }) {
                break;
            }
        }

        // The downloader ran and materialized the weight directory.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(weights_dir.exists());
    }
}
