use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::app::events::{Event, EventBus, LoggingHandler};
use crate::app::registry::{ModelSlotRegistry, SessionCell, SlotStatus};
use crate::config::RuntimeConfig;
use crate::core::context::ContextWindow;
use crate::core::model::{Backend, ModelSlot};
use crate::core::session::{CancelToken, GenerateRequest, Generation, GenerationStats, SessionConfig, StopReason};
use crate::error::{Result, RuntimeError};

const STREAM_BUFFER: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Newly decoded text; never splits a character.
    Text(String),
    /// Last item of a successful stream.
    Done(GenerationStats),
}

/// Finite stream of one generation's output.
///
/// Dropping it, or calling [`GenerationStream::cancel`], stops decoding at
/// the next step boundary. A cancelled stream that is drained further ends
/// with `Done` carrying `StopReason::Cancelled`.
pub struct GenerationStream {
    inner: ReceiverStream<Result<StreamEvent>>,
    cancel: CancelToken,
}

impl GenerationStream {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

impl Stream for GenerationStream {
    type Item = Result<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Public entry point: load-on-demand generation over a slot registry.
#[derive(Clone)]
pub struct ModelRuntime {
    registry: Arc<ModelSlotRegistry>,
    session: SessionConfig,
}

impl ModelRuntime {
    pub fn new(registry: ModelSlotRegistry, session: SessionConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            session,
        }
    }

    /// Live system probe, directory source and a logging subscriber.
    pub fn from_config(config: &RuntimeConfig, bindings: Vec<(ModelSlot, Arc<dyn Backend>)>) -> Self {
        let events = Arc::new(EventBus::new());
        events.subscribe(LoggingHandler);

        let builder = bindings
            .into_iter()
            .fold(ModelSlotRegistry::from_config(config).events(events), |b, (slot, backend)| {
                b.bind(slot, backend)
            });
        Self::new(builder.build(), config.session_config())
    }

    pub fn registry(&self) -> &Arc<ModelSlotRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventBus> {
        self.registry.events()
    }

    pub async fn ensure_loaded(&self, slot: ModelSlot) -> Result<()> {
        self.registry.ensure_loaded(slot).await
    }

    pub async fn unload(&self, slot: ModelSlot) -> Result<()> {
        self.registry.unload(slot).await
    }

    pub async fn unload_all(&self) {
        self.registry.unload_all().await
    }

    pub fn status(&self, slot: ModelSlot) -> Result<SlotStatus> {
        self.registry.status(slot)
    }

    /// Rejects bad sampling settings before anything is loaded.
    fn check_request(&self, request: &GenerateRequest) -> Result<()> {
        request.params.validate()?;
        let max_new = request.max_new_tokens.unwrap_or(self.session.max_new_tokens);
        ContextWindow::new(self.session.context_limit).input_budget(max_new)?;
        Ok(())
    }

    async fn ready_session(&self, slot: ModelSlot, request: &GenerateRequest) -> Result<SessionCell> {
        self.check_request(request)?;
        self.registry.ensure_loaded(slot).await?;
        self.registry.session(slot)
    }

    pub async fn generate(&self, slot: ModelSlot, request: GenerateRequest) -> Result<Generation> {
        let cell = self.ready_session(slot, &request).await?;
        let events = self.events().clone();
        tokio::task::spawn_blocking(move || decode(slot, &cell, &events, &request, &CancelToken::new(), |_| {}))
            .await
            .map_err(|e| RuntimeError::BackendStepFailed(format!("decode task failed: {}", e)))?
    }

    /// Like [`ModelRuntime::generate`], but `cancel` aborts with
    /// `RuntimeError::Cancelled`. Partial output still lands in history.
    pub async fn generate_cancellable(
        &self,
        slot: ModelSlot,
        request: GenerateRequest,
        cancel: CancelToken,
    ) -> Result<Generation> {
        let cell = self.ready_session(slot, &request).await?;
        let events = self.events().clone();
        let generation = tokio::task::spawn_blocking(move || decode(slot, &cell, &events, &request, &cancel, |_| {}))
            .await
            .map_err(|e| RuntimeError::BackendStepFailed(format!("decode task failed: {}", e)))??;

        match generation.stats.stop_reason {
            StopReason::Cancelled => Err(RuntimeError::Cancelled),
            _ => Ok(generation),
        }
    }

    pub async fn generate_streaming(&self, slot: ModelSlot, request: GenerateRequest) -> Result<GenerationStream> {
        let cell = self.ready_session(slot, &request).await?;
        let events = self.events().clone();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let cancel = CancelToken::new();
        let task_cancel = cancel.clone();

        tokio::task::spawn_blocking(move || {
            let text_tx = tx.clone();
            let on_text = |delta: &str| {
                if task_cancel.is_cancelled() {
                    return;
                }
                if text_tx.blocking_send(Ok(StreamEvent::Text(delta.to_string()))).is_err() {
                    // receiver dropped
                    task_cancel.cancel();
                }
            };

            let last = match decode(slot, &cell, &events, &request, &task_cancel, on_text) {
                Ok(generation) => Ok(StreamEvent::Done(generation.stats)),
                Err(e) => Err(e),
            };
            let _ = tx.blocking_send(last);
        });

        Ok(GenerationStream {
            inner: ReceiverStream::new(rx),
            cancel,
        })
    }

    /// Drops the slot's history and cache together.
    pub async fn clear_history(&self, slot: ModelSlot) -> Result<()> {
        let cell = self.registry.session(slot)?;
        tokio::task::spawn_blocking(move || {
            let mut guard = cell.lock();
            let session = guard.as_mut().ok_or(RuntimeError::SessionNotReady)?;
            session.clear_history();
            Ok(())
        })
        .await
        .map_err(|e| RuntimeError::BackendStepFailed(format!("clear task failed: {}", e)))?
    }
}

/// Runs one generation on the blocking pool with the session locked.
fn decode<F>(
    slot: ModelSlot,
    cell: &SessionCell,
    events: &EventBus,
    request: &GenerateRequest,
    cancel: &CancelToken,
    on_text: F,
) -> Result<Generation>
where
    F: FnMut(&str),
{
    let mut guard = cell.lock();
    let session = guard.as_mut().ok_or(RuntimeError::SessionNotReady)?;

    events.publish(Event::GenerationStarted { slot });
    let generation = session.generate_streaming(request, cancel, on_text)?;

    match generation.stats.stop_reason {
        StopReason::Cancelled => {
            debug!(%slot, tokens = generation.stats.generated_tokens, "generation cancelled");
            events.publish(Event::GenerationCancelled {
                slot,
                generated_tokens: generation.stats.generated_tokens,
            });
        }
        _ => events.publish(Event::GenerationFinished {
            slot,
            stats: generation.stats.clone(),
        }),
    }
    Ok(generation)
}
