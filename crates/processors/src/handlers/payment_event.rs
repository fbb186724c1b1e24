use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reliability::Result;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use store::IdempotencyScope;

use super::{ORDER_NOTIFICATION, PAYMENT_EVENT};
use crate::processor::{
    HIGH_PRIORITY, ProcessOutcome, QueueProcessor, parse_payload, required_str,
};
use crate::queue::JobQueue;
use crate::services::{PaymentStatus, PaymentStatusSink};

/// Idempotency key for a payment gateway event.
///
/// Uses the gateway's event ID when present, otherwise a digest of the
/// whole payload.
pub fn payment_event_key(payload: &serde_json::Value) -> Result<String> {
    let gateway = required_str(payload, "gateway")?;
    match payload.get("event_id").and_then(serde_json::Value::as_str) {
        Some(event_id) if !event_id.is_empty() => Ok(format!("{gateway}:{event_id}")),
        _ => {
            let digest = Sha256::digest(payload.to_string().as_bytes());
            Ok(format!("{gateway}:{}", hex::encode(digest)))
        }
    }
}

#[derive(Debug, Deserialize)]
struct PaymentEvent {
    #[serde(rename = "type")]
    event_type: String,
    order_id: String,
    #[serde(default)]
    customer_id: Option<String>,
    #[serde(default)]
    phone: Option<String>,
}

/// Applies payment gateway events to orders and notifies the customer.
pub struct PaymentEventProcessor {
    payments: Arc<dyn PaymentStatusSink>,
    queue: JobQueue,
}

impl PaymentEventProcessor {
    pub fn new(payments: Arc<dyn PaymentStatusSink>, queue: JobQueue) -> Self {
        Self { payments, queue }
    }
}

#[async_trait]
impl QueueProcessor for PaymentEventProcessor {
    fn name(&self) -> &'static str {
        "PaymentEventProcessor"
    }

    fn hook_name(&self) -> &'static str {
        PAYMENT_EVENT
    }

    fn scope(&self) -> IdempotencyScope {
        IdempotencyScope::Payment
    }

    fn idempotency_key(&self, payload: &serde_json::Value) -> Result<String> {
        payment_event_key(payload)
    }

    fn priority(&self) -> i32 {
        HIGH_PRIORITY
    }

    #[tracing::instrument(skip(self, payload))]
    async fn process(&self, payload: &serde_json::Value) -> Result<ProcessOutcome> {
        let event: PaymentEvent = parse_payload(payload)?;
        let Some(status) = PaymentStatus::from_event_type(&event.event_type) else {
            return Ok(ProcessOutcome::Skipped(format!(
                "unhandled payment event `{}`",
                event.event_type
            )));
        };

        self.payments.apply(&event.order_id, status).await?;
        tracing::info!(order_id = %event.order_id, status = status.as_str(), "payment status applied");

        if let (Some(customer_id), Some(phone)) = (&event.customer_id, &event.phone) {
            let notification = json!({
                "order_id": event.order_id,
                "status": format!("payment_{}", status.as_str()),
                "customer_id": customer_id,
                "phone": phone,
                "template": status.template(),
            });
            if !self.queue.is_scheduled(ORDER_NOTIFICATION, &notification).await? {
                self.queue
                    .dispatch(ORDER_NOTIFICATION, notification, Duration::ZERO)
                    .await?;
            }
        }

        Ok(ProcessOutcome::Completed)
    }
}
