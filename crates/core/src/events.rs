//! Event bus between the engine and its host.
//!
//! The engine never calls host code directly. Workers publish
//! [`EngineEvent`]s onto a broadcast channel; hosts subscribe and marshal
//! them onto whatever thread their UI toolkit requires. Streaming callbacks
//! run on the worker, so emission must never block.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;

/// Handler kinds that own a model slot. One model of each kind may be
/// resident at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Diffusion,
    Llm,
    VisionAgent,
}

/// Per-slot load state. Owned by the lifecycle managers; hosts only observe
/// it through `ModelStatusChanged` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    Failed,
}

/// Everything the engine tells the outside world.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    ModelStatusChanged {
        kind: ModelKind,
        status: ModelStatus,
    },
    TokenStreamed {
        request_id: u64,
        content: String,
        sequence: u64,
        is_first: bool,
        is_end_of_message: bool,
    },
    GenerationError {
        request_id: u64,
        message: String,
    },
    ImageGenerated {
        request_id: u64,
        width: u32,
        height: u32,
    },
    /// A load found no weights on disk; the download service should fetch
    /// them, after which the load is retried.
    DownloadRequested {
        kind: ModelKind,
        name: String,
    },
    DownloadComplete {
        repo_id: String,
        path: PathBuf,
    },
    DownloadFailed {
        repo_id: String,
        message: String,
    },
}

/// Broadcast wrapper. Cloning is cheap; every clone publishes to the same
/// set of subscribers.
#[derive(Debug, Clone)]
pub struct SignalBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl SignalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. A send with no live subscribers is not an error.
    pub fn emit(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event emitted with no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_all_subscribers() {
        let bus = SignalBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(EngineEvent::ModelStatusChanged {
            kind: ModelKind::Llm,
            status: ModelStatus::Loading,
        });

        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                EngineEvent::ModelStatusChanged { kind, status } => {
                    assert_eq!(kind, ModelKind::Llm);
                    assert_eq!(status, ModelStatus::Loading);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn emit_without_subscribers_is_a_no_op() {
        let bus = SignalBus::new(8);
        bus.emit(EngineEvent::GenerationError {
            request_id: 1,
            message: "boom".into(),
        });
    }
}
