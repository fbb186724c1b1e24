//! Where verified payment gateway events land.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reliability::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Paid,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    /// Maps a gateway event type (`payment.succeeded`, ...) to a status.
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            "payment.succeeded" | "charge.succeeded" => Some(PaymentStatus::Paid),
            "payment.failed" | "charge.failed" => Some(PaymentStatus::Failed),
            "payment.refunded" | "charge.refunded" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }

    /// Notification template announcing this status to the customer.
    pub fn template(&self) -> &'static str {
        match self {
            PaymentStatus::Paid => "payment_received",
            PaymentStatus::Failed => "payment_failed",
            PaymentStatus::Refunded => "payment_refunded",
        }
    }
}

/// Applies payment outcomes to orders.
#[async_trait]
pub trait PaymentStatusSink: Send + Sync {
    async fn apply(&self, order_id: &str, status: PaymentStatus) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentStatusSink {
    statuses: Arc<RwLock<HashMap<String, Vec<PaymentStatus>>>>,
}

impl InMemoryPaymentStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every status applied to the order, oldest first.
    pub async fn history(&self, order_id: &str) -> Vec<PaymentStatus> {
        self.statuses
            .read()
            .await
            .get(order_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl PaymentStatusSink for InMemoryPaymentStatusSink {
    async fn apply(&self, order_id: &str, status: PaymentStatus) -> Result<()> {
        self.statuses
            .write()
            .await
            .entry(order_id.to_string())
            .or_default()
            .push(status);
        Ok(())
    }
}
