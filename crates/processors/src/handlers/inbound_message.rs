use std::sync::Arc;

use async_trait::async_trait;
use reliability::{EventBus, Result};
use serde_json::json;
use store::IdempotencyScope;

use super::{CONVERSATION_EVENT, INBOUND_MESSAGE};
use crate::processor::{ProcessOutcome, QueueProcessor, parse_payload, required_str};
use crate::services::{InboundMessage, Intent, IntentClassifier, MessageRepository, PreferenceStore};

/// Stores a customer message, classifies it and drives the conversation.
pub struct InboundMessageProcessor {
    messages: Arc<dyn MessageRepository>,
    classifier: Arc<dyn IntentClassifier>,
    preferences: Arc<dyn PreferenceStore>,
    events: EventBus,
}

impl InboundMessageProcessor {
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        classifier: Arc<dyn IntentClassifier>,
        preferences: Arc<dyn PreferenceStore>,
        events: EventBus,
    ) -> Self {
        Self {
            messages,
            classifier,
            preferences,
            events,
        }
    }
}

#[async_trait]
impl QueueProcessor for InboundMessageProcessor {
    fn name(&self) -> &'static str {
        "InboundMessageProcessor"
    }

    fn hook_name(&self) -> &'static str {
        INBOUND_MESSAGE
    }

    fn scope(&self) -> IdempotencyScope {
        IdempotencyScope::Webhook
    }

    fn idempotency_key(&self, payload: &serde_json::Value) -> Result<String> {
        required_str(payload, "message_id").map(str::to_string)
    }

    #[tracing::instrument(skip(self, payload))]
    async fn process(&self, payload: &serde_json::Value) -> Result<ProcessOutcome> {
        let message: InboundMessage = parse_payload(payload)?;

        if !self.messages.store(&message).await? {
            // A previous attempt stored it before failing later on.
            tracing::debug!(message_id = %message.message_id, "message already stored");
        }

        let intent = match message.text.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => self.classifier.classify(text).await?,
            _ => Intent::Unknown,
        };

        match intent {
            Intent::OptOut => self.preferences.set_opted_out(&message.from, true).await?,
            Intent::OptIn => self.preferences.set_opted_out(&message.from, false).await?,
            _ => {}
        }

        let event = json!({
            "message_id": message.message_id,
            "from": message.from,
            "intent": intent.as_str(),
            "event": intent.conversation_event(),
        });
        self.events.emit(CONVERSATION_EVENT, &event).await;

        tracing::info!(
            message_id = %message.message_id,
            intent = intent.as_str(),
            "inbound message processed"
        );
        Ok(ProcessOutcome::Completed)
    }
}
