//! Inbound message storage and intent classification.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reliability::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// A customer message received from the messaging provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Provider-assigned message ID.
    pub message_id: String,
    /// Sender phone number or handle.
    pub from: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

fn default_message_type() -> String {
    "text".to_string()
}

/// Persists inbound messages.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Stores the message. Returns false if a message with the same ID exists.
    async fn store(&self, message: &InboundMessage) -> Result<bool>;

    async fn get(&self, message_id: &str) -> Result<Option<InboundMessage>>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryMessageRepository {
    messages: Arc<RwLock<HashMap<String, InboundMessage>>>,
}

impl InMemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.messages.read().await.len()
    }
}

#[async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn store(&self, message: &InboundMessage) -> Result<bool> {
        let mut messages = self.messages.write().await;
        if messages.contains_key(&message.message_id) {
            return Ok(false);
        }
        messages.insert(message.message_id.clone(), message.clone());
        Ok(true)
    }

    async fn get(&self, message_id: &str) -> Result<Option<InboundMessage>> {
        Ok(self.messages.read().await.get(message_id).cloned())
    }
}

/// What a customer wants, as far as the classifier can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Greeting,
    OrderStatus,
    Purchase,
    Support,
    OptOut,
    OptIn,
    Unknown,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Greeting => "greeting",
            Intent::OrderStatus => "order_status",
            Intent::Purchase => "purchase",
            Intent::Support => "support",
            Intent::OptOut => "opt_out",
            Intent::OptIn => "opt_in",
            Intent::Unknown => "unknown",
        }
    }

    /// The conversation state machine event this intent drives.
    pub fn conversation_event(&self) -> &'static str {
        match self {
            Intent::Greeting => "greet",
            Intent::OrderStatus => "request_order_status",
            Intent::Purchase => "browse_catalog",
            Intent::Support => "request_human",
            Intent::OptOut => "unsubscribe",
            Intent::OptIn => "subscribe",
            Intent::Unknown => "fallback",
        }
    }
}

/// Maps message text to an [`Intent`].
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Intent>;
}

/// Classifies by keyword. The first matching rule wins.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    rules: Vec<(Intent, Vec<String>)>,
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        let rule = |intent, words: &[&str]| (intent, words.iter().map(|w| w.to_string()).collect());
        Self {
            rules: vec![
                rule(Intent::OptOut, &["stop", "unsubscribe", "opt out"]),
                rule(Intent::OptIn, &["start", "subscribe", "opt in"]),
                rule(Intent::OrderStatus, &["order", "tracking", "where is", "shipped"]),
                rule(Intent::Support, &["help", "agent", "human", "problem", "refund"]),
                rule(Intent::Purchase, &["buy", "price", "catalog", "menu"]),
                rule(Intent::Greeting, &["hello", "hi", "hey", "good morning"]),
            ],
        }
    }
}

impl KeywordClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(text: &str, keyword: &str) -> bool {
        if keyword.contains(' ') {
            return text.contains(keyword);
        }
        text.split(|c: char| !c.is_alphanumeric())
            .any(|word| word == keyword)
    }
}

#[async_trait]
impl IntentClassifier for KeywordClassifier {
    async fn classify(&self, text: &str) -> Result<Intent> {
        let text = text.to_lowercase();
        Ok(self
            .rules
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| Self::matches(&text, k)))
            .map(|(intent, _)| *intent)
            .unwrap_or(Intent::Unknown))
    }
}
