use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reliability::Result;
use serde::Deserialize;
use serde_json::json;
use store::IdempotencyScope;

use super::{DELIVERY_STATUS, WEBHOOK_ERROR};
use crate::processor::{ProcessOutcome, QueueProcessor, parse_payload, required_str};
use crate::queue::JobQueue;
use crate::services::DeliveryLog;

#[derive(Debug, Deserialize)]
struct StatusCallback {
    message_id: String,
    status: String,
    #[serde(default)]
    recipient: Option<String>,
    #[serde(default)]
    errors: Vec<ProviderError>,
}

#[derive(Debug, Deserialize)]
struct ProviderError {
    code: i64,
    #[serde(default)]
    title: Option<String>,
}

/// Applies provider delivery receipts to the delivery log.
///
/// Failed deliveries that carry provider errors fan out one
/// `webhook_error` job per error.
pub struct DeliveryStatusProcessor {
    deliveries: Arc<dyn DeliveryLog>,
    queue: JobQueue,
}

impl DeliveryStatusProcessor {
    pub fn new(deliveries: Arc<dyn DeliveryLog>, queue: JobQueue) -> Self {
        Self { deliveries, queue }
    }
}

#[async_trait]
impl QueueProcessor for DeliveryStatusProcessor {
    fn name(&self) -> &'static str {
        "DeliveryStatusProcessor"
    }

    fn hook_name(&self) -> &'static str {
        DELIVERY_STATUS
    }

    fn scope(&self) -> IdempotencyScope {
        IdempotencyScope::Webhook
    }

    fn idempotency_key(&self, payload: &serde_json::Value) -> Result<String> {
        let message_id = required_str(payload, "message_id")?;
        let status = required_str(payload, "status")?;
        Ok(format!("{message_id}:{status}"))
    }

    #[tracing::instrument(skip(self, payload))]
    async fn process(&self, payload: &serde_json::Value) -> Result<ProcessOutcome> {
        let callback: StatusCallback = parse_payload(payload)?;

        let error = callback.errors.first().map(|e| match &e.title {
            Some(title) => format!("{}: {title}", e.code),
            None => e.code.to_string(),
        });
        let known = self
            .deliveries
            .update_status(&callback.message_id, &callback.status, error)
            .await?;
        if !known {
            tracing::debug!(message_id = %callback.message_id, "status for unknown message");
        }

        if callback.status == "failed" {
            for err in &callback.errors {
                let payload = json!({
                    "code": err.code,
                    "title": err.title,
                    "message_id": callback.message_id,
                    "recipient": callback.recipient,
                });
                if !self.queue.is_scheduled(WEBHOOK_ERROR, &payload).await? {
                    self.queue
                        .dispatch(WEBHOOK_ERROR, payload, Duration::ZERO)
                        .await?;
                }
            }
        }

        metrics::counter!("delivery_status_total", "status" => callback.status.clone())
            .increment(1);
        Ok(ProcessOutcome::Completed)
    }
}
