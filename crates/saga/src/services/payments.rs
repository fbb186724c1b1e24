//! Payment gateway client.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reliability::{ProcessError, Result};
use tokio::sync::RwLock;

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Charges the customer and returns the gateway's payment ID.
    async fn charge(&self, order_id: &str, amount_cents: i64, token: &str) -> Result<String>;

    /// Voids or refunds a charge.
    async fn refund(&self, payment_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeStatus {
    Captured,
    Refunded,
}

#[derive(Debug, Default)]
struct GatewayState {
    charges: HashMap<String, (String, i64, ChargeStatus)>,
    failures: VecDeque<ProcessError>,
    delay: Option<Duration>,
    next_id: u32,
}

/// In-memory gateway with scripted failures and latency.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentGateway {
    state: Arc<RwLock<GatewayState>>,
}

impl InMemoryPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `charge` calls fail with these errors, in order.
    pub async fn fail_with(&self, errors: impl IntoIterator<Item = ProcessError>) {
        self.state.write().await.failures.extend(errors);
    }

    /// Delays every charge by `delay`.
    pub async fn set_delay(&self, delay: Option<Duration>) {
        self.state.write().await.delay = delay;
    }

    /// Number of charges still captured.
    pub async fn captured_count(&self) -> usize {
        self.state
            .read()
            .await
            .charges
            .values()
            .filter(|(_, _, status)| *status == ChargeStatus::Captured)
            .count()
    }

    pub async fn charge_status(&self, payment_id: &str) -> Option<ChargeStatus> {
        self.state
            .read()
            .await
            .charges
            .get(payment_id)
            .map(|(_, _, status)| *status)
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn charge(&self, order_id: &str, amount_cents: i64, _token: &str) -> Result<String> {
        let delay = self.state.read().await.delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.write().await;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        state.next_id += 1;
        let id = format!("PAY-{:05}", state.next_id);
        state.charges.insert(
            id.clone(),
            (order_id.to_string(), amount_cents, ChargeStatus::Captured),
        );
        Ok(id)
    }

    async fn refund(&self, payment_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let charge = state
            .charges
            .get_mut(payment_id)
            .ok_or_else(|| ProcessError::permanent(format!("unknown payment `{payment_id}`")))?;
        charge.2 = ChargeStatus::Refunded;
        Ok(())
    }
}
