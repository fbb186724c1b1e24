use std::sync::Arc;

use async_trait::async_trait;
use common::{Clock, SystemClock};
use reliability::{CircuitBreaker, Result};
use serde::Deserialize;
use store::IdempotencyScope;

use super::ORDER_NOTIFICATION;
use crate::processor::{
    HIGH_PRIORITY, ProcessOutcome, QueueProcessor, parse_payload, required_str,
};
use crate::quiet_hours::QuietHours;
use crate::services::{
    DeliveryLog, DeliveryRecord, MessagingClient, OutboundMessage, PreferenceStore,
    TemplateRenderer,
};

#[derive(Debug, Deserialize)]
struct OrderNotification {
    order_id: String,
    status: String,
    customer_id: String,
    phone: String,
    #[serde(default)]
    template: Option<String>,
    #[serde(default)]
    data: serde_json::Map<String, serde_json::Value>,
}

/// Sends an order status notification through the messaging provider.
pub struct OrderNotificationProcessor {
    messaging: Arc<dyn MessagingClient>,
    templates: Arc<dyn TemplateRenderer>,
    deliveries: Arc<dyn DeliveryLog>,
    preferences: Arc<dyn PreferenceStore>,
    breaker: Arc<CircuitBreaker>,
    quiet_hours: Option<QuietHours>,
    clock: Arc<dyn Clock>,
}

impl OrderNotificationProcessor {
    pub fn new(
        messaging: Arc<dyn MessagingClient>,
        templates: Arc<dyn TemplateRenderer>,
        deliveries: Arc<dyn DeliveryLog>,
        preferences: Arc<dyn PreferenceStore>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            messaging,
            templates,
            deliveries,
            preferences,
            breaker,
            quiet_hours: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_quiet_hours(mut self, quiet_hours: Option<QuietHours>) -> Self {
        self.quiet_hours = quiet_hours;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl QueueProcessor for OrderNotificationProcessor {
    fn name(&self) -> &'static str {
        "OrderNotificationProcessor"
    }

    fn hook_name(&self) -> &'static str {
        ORDER_NOTIFICATION
    }

    fn scope(&self) -> IdempotencyScope {
        IdempotencyScope::Notification
    }

    fn idempotency_key(&self, payload: &serde_json::Value) -> Result<String> {
        let order_id = required_str(payload, "order_id")?;
        let status = required_str(payload, "status")?;
        Ok(format!("{order_id}:{status}"))
    }

    async fn skip_reason(&self, payload: &serde_json::Value) -> Result<Option<String>> {
        let customer_id = required_str(payload, "customer_id")?;
        if self.preferences.is_opted_out(customer_id).await? {
            return Ok(Some("customer opted out".to_string()));
        }
        if let Some(quiet) = &self.quiet_hours
            && quiet.contains(self.clock.now())
        {
            return Ok(Some("quiet hours".to_string()));
        }
        Ok(None)
    }

    #[tracing::instrument(skip(self, payload))]
    async fn process(&self, payload: &serde_json::Value) -> Result<ProcessOutcome> {
        let notification: OrderNotification = parse_payload(payload)?;
        let template = notification
            .template
            .clone()
            .unwrap_or_else(|| format!("order_{}", notification.status));

        let mut data = notification.data.clone();
        data.entry("order_id")
            .or_insert_with(|| serde_json::Value::String(notification.order_id.clone()));
        let body = self
            .templates
            .render(&template, &serde_json::Value::Object(data))
            .await?;

        let message = OutboundMessage {
            to: notification.phone.clone(),
            body,
            template: template.clone(),
        };

        match self.messaging.send(&message).await {
            Ok(provider_id) => {
                self.deliveries
                    .record_attempt(DeliveryRecord {
                        provider_message_id: Some(provider_id.clone()),
                        recipient: notification.phone,
                        template,
                        status: "sent".to_string(),
                        error: None,
                        updated_at: self.clock.now(),
                    })
                    .await?;
                tracing::info!(
                    order_id = %notification.order_id,
                    customer_id = %notification.customer_id,
                    %provider_id,
                    "order notification sent"
                );
                Ok(ProcessOutcome::Completed)
            }
            Err(e) => {
                self.deliveries
                    .record_attempt(DeliveryRecord {
                        provider_message_id: None,
                        recipient: notification.phone,
                        template,
                        status: "failed".to_string(),
                        error: Some(e.to_string()),
                        updated_at: self.clock.now(),
                    })
                    .await?;
                Err(e)
            }
        }
    }

    fn max_retries(&self) -> u32 {
        5
    }

    fn priority(&self) -> i32 {
        HIGH_PRIORITY
    }

    fn circuit_breaker(&self) -> Option<Arc<CircuitBreaker>> {
        Some(self.breaker.clone())
    }
}
