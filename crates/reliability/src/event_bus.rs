//! Named in-process events.
//!
//! Handlers are registered once through [`EventBusBuilder`]; the built
//! [`EventBus`] is immutable and cheap to clone.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::Result;

/// Receives events published under the names it was registered for.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Returns the handler name for logging.
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &str, payload: &serde_json::Value) -> Result<()>;
}

/// Registers handlers before the bus is frozen.
#[derive(Default)]
pub struct EventBusBuilder {
    handlers: HashMap<String, Vec<Arc<dyn EventHandler>>>,
}

impl EventBusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `handler` to `event`. Handlers run in registration order.
    pub fn on(mut self, event: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.entry(event.into()).or_default().push(handler);
        self
    }

    pub fn build(self) -> EventBus {
        EventBus {
            handlers: Arc::new(self.handlers),
        }
    }
}

/// An immutable event bus.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::new()
    }

    /// Delivers `payload` to every handler subscribed to `event`.
    ///
    /// A failing handler is logged and does not stop the others. Returns the
    /// number of handlers that succeeded.
    #[tracing::instrument(skip(self, payload))]
    pub async fn emit(&self, event: &str, payload: &serde_json::Value) -> usize {
        let Some(handlers) = self.handlers.get(event) else {
            return 0;
        };

        let mut delivered = 0;
        for handler in handlers {
            match handler.handle(event, payload).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(handler = handler.name(), error = %e, "event handler failed");
                    metrics::counter!("event_handler_failures_total", "event" => event.to_string())
                        .increment(1);
                }
            }
        }
        delivered
    }

    pub fn has_handlers(&self, event: &str) -> bool {
        self.handlers.get(event).is_some_and(|h| !h.is_empty())
    }
}

/// An event captured by [`RecordingHandler`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub name: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Keeps every event it receives. Used for operator-facing event logs and tests.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    events: Arc<RwLock<Vec<RecordedEvent>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<RecordedEvent> {
        self.events.read().await.clone()
    }

    /// Events received under `name`.
    pub async fn named(&self, name: &str) -> Vec<RecordedEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.name == name)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    fn name(&self) -> &'static str {
        "RecordingHandler"
    }

    async fn handle(&self, event: &str, payload: &serde_json::Value) -> Result<()> {
        self.events.write().await.push(RecordedEvent {
            name: event.to_string(),
            payload: payload.clone(),
            received_at: Utc::now(),
        });
        Ok(())
    }
}
