//! Outbound messaging: templates, the provider client and the delivery log.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reliability::{ProcessError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// A message ready to hand to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub to: String,
    pub body: String,
    /// Template the body was rendered from.
    pub template: String,
}

/// Sends messages through the messaging provider.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Sends the message and returns the provider's message ID.
    async fn send(&self, message: &OutboundMessage) -> Result<String>;
}

#[derive(Debug, Default)]
struct ClientState {
    sent: Vec<OutboundMessage>,
    failures: VecDeque<ProcessError>,
    next_id: u64,
}

/// Records sent messages. Failures can be queued to simulate provider outages.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMessagingClient {
    state: Arc<RwLock<ClientState>>,
}

impl InMemoryMessagingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `send` calls fail with the given errors, in order.
    pub async fn fail_with(&self, errors: impl IntoIterator<Item = ProcessError>) {
        self.state.write().await.failures.extend(errors);
    }

    pub async fn sent(&self) -> Vec<OutboundMessage> {
        self.state.read().await.sent.clone()
    }
}

#[async_trait]
impl MessagingClient for InMemoryMessagingClient {
    async fn send(&self, message: &OutboundMessage) -> Result<String> {
        let mut state = self.state.write().await;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        state.next_id += 1;
        let id = format!("wamid.out.{:06}", state.next_id);
        state.sent.push(message.clone());
        Ok(id)
    }
}

/// One send attempt and its latest provider status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub provider_message_id: Option<String>,
    pub recipient: String,
    pub template: String,
    pub status: String,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Tracks outbound delivery attempts and provider status callbacks.
#[async_trait]
pub trait DeliveryLog: Send + Sync {
    async fn record_attempt(&self, record: DeliveryRecord) -> Result<()>;

    /// Applies a provider status callback. Returns false if the message is unknown.
    async fn update_status(
        &self,
        provider_message_id: &str,
        status: &str,
        error: Option<String>,
    ) -> Result<bool>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryDeliveryLog {
    records: Arc<RwLock<Vec<DeliveryRecord>>>,
}

impl InMemoryDeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<DeliveryRecord> {
        self.records.read().await.clone()
    }

    pub async fn find(&self, provider_message_id: &str) -> Option<DeliveryRecord> {
        self.records
            .read()
            .await
            .iter()
            .find(|r| r.provider_message_id.as_deref() == Some(provider_message_id))
            .cloned()
    }
}

#[async_trait]
impl DeliveryLog for InMemoryDeliveryLog {
    async fn record_attempt(&self, record: DeliveryRecord) -> Result<()> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn update_status(
        &self,
        provider_message_id: &str,
        status: &str,
        error: Option<String>,
    ) -> Result<bool> {
        let mut records = self.records.write().await;
        match records
            .iter_mut()
            .find(|r| r.provider_message_id.as_deref() == Some(provider_message_id))
        {
            Some(record) => {
                record.status = status.to_string();
                record.error = error;
                record.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Renders a named template against event data.
#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    async fn render(&self, template: &str, data: &serde_json::Value) -> Result<String>;
}

/// `{{field}}` substitution over a fixed template table.
#[derive(Debug, Clone)]
pub struct SimpleTemplateRenderer {
    templates: HashMap<String, String>,
}

impl Default for SimpleTemplateRenderer {
    fn default() -> Self {
        Self::new()
            .with_template(
                "order_confirmed",
                "Thanks for your order {{order_id}}! We'll let you know when it ships.",
            )
            .with_template(
                "order_shipped",
                "Good news: order {{order_id}} is on its way.",
            )
            .with_template(
                "order_delivered",
                "Order {{order_id}} was delivered. Enjoy!",
            )
            .with_template(
                "order_cancelled",
                "Order {{order_id}} was cancelled.",
            )
            .with_template(
                "payment_received",
                "We received your payment for order {{order_id}}.",
            )
            .with_template(
                "payment_failed",
                "The payment for order {{order_id}} did not go through. Please try again or choose another method.",
            )
            .with_template(
                "payment_refunded",
                "Your payment for order {{order_id}} was refunded.",
            )
    }
}

impl SimpleTemplateRenderer {
    /// A renderer with no templates.
    pub fn new() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    pub fn with_template(mut self, name: impl Into<String>, body: impl Into<String>) -> Self {
        self.templates.insert(name.into(), body.into());
        self
    }
}

#[async_trait]
impl TemplateRenderer for SimpleTemplateRenderer {
    async fn render(&self, template: &str, data: &serde_json::Value) -> Result<String> {
        let body = self
            .templates
            .get(template)
            .ok_or_else(|| ProcessError::validation(format!("unknown template `{template}`")))?;

        let mut rendered = body.clone();
        if let Some(fields) = data.as_object() {
            for (name, value) in fields {
                let text = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                rendered = rendered.replace(&format!("{{{{{name}}}}}"), &text);
            }
        }

        if rendered.contains("{{") {
            return Err(ProcessError::validation(format!(
                "template `{template}` has unfilled placeholders"
            )));
        }
        Ok(rendered)
    }
}
