use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::model::{ModelSlot, ModelTier};
use crate::core::session::GenerationStats;

pub type EventCallback = Box<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Loading { slot: ModelSlot },
    Loaded { slot: ModelSlot, tier: ModelTier, backend: String },
    LoadFailed { slot: ModelSlot, error: String },
    Unloaded { slot: ModelSlot },
    GenerationStarted { slot: ModelSlot },
    GenerationFinished { slot: ModelSlot, stats: GenerationStats },
    GenerationCancelled { slot: ModelSlot, generated_tokens: usize },
}

impl Event {
    pub fn slot(&self) -> ModelSlot {
        match self {
            Event::Loading { slot }
            | Event::Loaded { slot, .. }
            | Event::LoadFailed { slot, .. }
            | Event::Unloaded { slot }
            | Event::GenerationStarted { slot }
            | Event::GenerationFinished { slot, .. }
            | Event::GenerationCancelled { slot, .. } => *slot,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Event::Loading { .. } => "loading",
            Event::Loaded { .. } => "loaded",
            Event::LoadFailed { .. } => "load_failed",
            Event::Unloaded { .. } => "unloaded",
            Event::GenerationStarted { .. } => "generation_started",
            Event::GenerationFinished { .. } => "generation_finished",
            Event::GenerationCancelled { .. } => "generation_cancelled",
        }
    }
}

pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event);
    fn name(&self) -> &str;
}

pub type HandlerId = usize;

/// Fan-out of runtime events to subscribed handlers. Handlers run inline on
/// the publishing thread and must not block.
#[allow(clippy::type_complexity)]
pub struct EventBus {
    handlers: RwLock<HashMap<HandlerId, (String, Arc<dyn EventHandler>)>>,
    callbacks: RwLock<HashMap<&'static str, Vec<EventCallback>>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
        }
    }

    pub fn subscribe<H: EventHandler + 'static>(&self, handler: H) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = handler.name().to_string();
        self.handlers.write().insert(id, (name, Arc::new(handler)));
        id
    }

    /// `event_type` is one of [`Event::type_name`].
    pub fn subscribe_to(&self, event_type: &'static str, callback: EventCallback) {
        self.callbacks.write().entry(event_type).or_default().push(callback);
    }

    pub fn unsubscribe(&self, handler_id: HandlerId) {
        self.handlers.write().remove(&handler_id);
    }

    pub fn publish(&self, event: Event) {
        for (_, handler) in self.handlers.read().values() {
            handler.handle(&event);
        }

        if let Some(callbacks) = self.callbacks.read().get(event.type_name()) {
            for callback in callbacks {
                callback(&event);
            }
        }
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.handlers.read().values().map(|(name, _)| name.clone()).collect()
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
        self.callbacks.write().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &Event) {
        match event {
            Event::LoadFailed { slot, error } => tracing::warn!(%slot, %error, "load failed"),
            Event::GenerationStarted { .. } | Event::GenerationCancelled { .. } => {
                tracing::debug!(slot = %event.slot(), "event: {:?}", event)
            }
            _ => tracing::info!(slot = %event.slot(), "event: {:?}", event),
        }
    }

    fn name(&self) -> &str {
        "logging"
    }
}
