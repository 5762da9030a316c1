//! Async adapters over the event bus.

use futures_util::Stream;
use tokio::sync::broadcast::error::RecvError;

use artforge_core::events::{EngineEvent, SignalBus};
use artforge_runtime_api::TokenEvent;

/// The token events for one request, as a `Stream`. Completes after the
/// terminal end-of-message event (which is always delivered exactly once,
/// including on interruption and error).
pub fn token_stream(bus: &SignalBus, request_id: u64) -> impl Stream<Item = TokenEvent> {
    let mut rx = bus.subscribe();
    async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(EngineEvent::TokenStreamed {
                    request_id: id,
                    content,
                    sequence,
                    is_first,
                    is_end_of_message,
                }) if id == request_id => {
                    let done = is_end_of_message;
                    yield TokenEvent {
                        request_id: id,
                        content,
                        sequence,
                        is_first,
                        is_end_of_message,
                    };
                    if done {
                        break;
                    }
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "token stream lagged behind the bus");
                    continue;
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn token(request_id: u64, sequence: u64, content: &str, end: bool) -> EngineEvent {
        EngineEvent::TokenStreamed {
            request_id,
            content: content.to_string(),
            sequence,
            is_first: sequence == 0,
            is_end_of_message: end,
        }
    }

    #[tokio::test]
    async fn stream_filters_by_request_and_ends_on_terminal() {
        let bus = SignalBus::new(32);
        let stream = token_stream(&bus, 7);
        tokio::pin!(stream);

        bus.emit(token(9, 0, "other request", false));
        bus.emit(token(7, 0, "Hel", false));
        bus.emit(token(7, 1, "lo", false));
        bus.emit(token(7, 2, "", true));

        let collected: Vec<TokenEvent> = stream.collect().await;
        assert_eq!(collected.len(), 3);
        assert_eq!(collected[0].content, "Hel");
        assert!(collected[2].is_end_of_message);
    }
}
